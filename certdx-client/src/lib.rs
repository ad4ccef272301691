//! Client daemon (spec §4.8): watches a configured list of certificates,
//! dispatches HTTP poll or gRPC stream subscription, and runs update
//! handlers (write-to-disk plus reload command) whenever material changes.

pub mod failover;
pub mod grpc_client;
pub mod http_client;
pub mod update;
pub mod watcher;

pub use failover::spawn_failover_driver;
pub use http_client::spawn_http_poller;
pub use update::{FileUpdateHandler, UpdateHandler};
pub use watcher::{spawn_watcher, CertData, WatchingCert};

//! ACME adapter contract (spec §4.5): the core never speaks ACME directly,
//! it calls an injected [`AcmeProvider`]. This crate supplies the default
//! provider, backed by `instant-acme`, plus account-key persistence and a
//! pluggable challenge solver.

pub mod account;
pub mod challenge;
pub mod provider;

pub use account::AccountKey;
pub use challenge::{ChallengeSolver, MemoryHttp01Solver};
pub use provider::{AcmeProvider, InstantAcmeProvider};

//! certdx - centralized TLS certificate issuance and distribution.
//!
//! Entry point for both the server and client daemon; mode selection and
//! shared flags follow the source's `exec/server` / `exec/client` binaries.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "certdx")]
#[command(author, version, about = "Centralized TLS certificate issuance and distribution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the certificate issuance server.
    Server {
        #[arg(long, default_value = "server.toml")]
        conf: String,
        #[arg(long)]
        log: Option<String>,
        #[arg(long)]
        debug: bool,
    },
    /// Run the client daemon.
    Client {
        #[arg(long, default_value = "client.toml")]
        conf: String,
        #[arg(long)]
        log: Option<String>,
        #[arg(long)]
        debug: bool,
        /// Validate configuration and exit without starting any listeners.
        #[arg(long)]
        test: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (debug, log) = match &cli.command {
        Commands::Server { debug, log, .. } => (*debug, log.clone()),
        Commands::Client { debug, log, .. } => (*debug, log.clone()),
    };
    init_tracing(debug, log.as_deref());

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Server { conf, .. } => run_server(&conf).await,
            Commands::Client { conf, test, .. } => run_client(&conf, test).await,
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal error, exiting");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(debug: bool, log_path: Option<&str>) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    let registry = tracing_subscriber::registry().with(filter);

    match log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("failed to open log file {path}: {e}"));
            registry.with(tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false)).init();
        }
        None => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

async fn run_server(conf_path: &str) -> anyhow::Result<()> {
    let config = certdx_config::load_server_config(conf_path)?;
    tracing::info!(conf = conf_path, "loaded server configuration");

    let private_dir = std::path::Path::new("./private");
    let account_key = certdx_acme::AccountKey::load(private_dir, &config.acme.email, &config.acme.provider)?;
    let challenge_solver = certdx_acme::MemoryHttp01Solver::new();
    let acme = Arc::new(certdx_acme::InstantAcmeProvider::new(&config.acme.provider, &config.acme.email, account_key, challenge_solver.clone()).await?);

    let initial_catalog = certdx_cache::catalog::load(&config.cache_path);
    let catalog = certdx_cache::CatalogHandle::spawn(config.cache_path.clone(), initial_catalog);

    let policy = certdx_cache::entry::RenewalPolicy {
        cert_life_time: config.acme.cert_life_time_duration(),
        renew_time_left: config.acme.renew_time_left_duration(),
        retry_count: config.acme.retry_count,
    };
    let cache = certdx_cache::CertCache::new(acme, catalog, policy);

    let mut tasks = Vec::new();

    if config.http.enabled {
        let addr = config.http.listen.parse().map_err(|e| anyhow::anyhow!("invalid http.listen address: {e}"))?;
        let state = certdx_server::http_api::HttpApiState {
            cache: cache.clone(),
            allowed_domains: config.acme.allowed_domains.clone(),
            api_path: config.http.api_path.clone(),
            token: config.http.token.clone(),
            renew_time_left_ns: config.acme.renew_time_left_duration().as_nanos() as i64,
            challenge_solver: challenge_solver.clone(),
        };

        if config.http.secure {
            let names = if config.http.names.is_empty() {
                return Err(anyhow::anyhow!("http.secure = true requires http.names to name the listener's own certificate"));
            } else {
                config.http.names.clone()
            };
            let server_entry = cache.get_or_create(&names).await;
            server_entry.subscribe(&cache).await;
            tasks.push(tokio::spawn(async move {
                if let Err(e) = certdx_server::run_https_api(addr, state, server_entry).await {
                    tracing::error!(error = %e, "HTTPS pull API exited");
                }
            }));
        } else {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = certdx_server::run_http_api(addr, state).await {
                    tracing::error!(error = %e, "HTTP pull API exited");
                }
            }));
        }
    }

    if config.grpc.enabled {
        let addr = config.grpc.listen.parse().map_err(|e| anyhow::anyhow!("invalid grpc.listen address: {e}"))?;
        let ca_pem = std::fs::read(&config.mtls.ca)?;
        let cert_pem = std::fs::read(&config.mtls.certificate)?;
        let key_pem = std::fs::read(&config.mtls.key)?;
        let cache = cache.clone();
        let allowed_domains = config.acme.allowed_domains.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = certdx_server::run_sds_listener(addr, cache, allowed_domains, ca_pem, cert_pem, key_pem).await {
                tracing::error!(error = %e, "SDS gRPC listener exited");
            }
        }));
    }

    wait_for_shutdown().await;
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn run_client(conf_path: &str, test_only: bool) -> anyhow::Result<()> {
    let config = certdx_config::load_client_config(conf_path)?;
    tracing::info!(conf = conf_path, "loaded client configuration");

    if test_only {
        println!("configuration '{conf_path}' is valid");
        return Ok(());
    }

    let stop = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut senders = HashMap::new();

    for cert_cfg in &config.certs {
        let cert = certdx_client::WatchingCert::from_config(cert_cfg);
        let (tx, rx) = mpsc::channel(4);
        senders.insert(cert.name.clone(), tx);
        tasks.push(certdx_client::spawn_watcher(cert, certdx_client::FileUpdateHandler::new(), rx));
    }

    match config.common.mode.as_str() {
        "http" => {
            let http = config.http.clone().expect("validated: http section present for http mode");
            for cert_cfg in &config.certs {
                let cert = certdx_client::WatchingCert::from_config(cert_cfg);
                let tx = senders.get(&cert.name).expect("sender registered above").clone();
                tasks.push(certdx_client::spawn_http_poller(cert, http.clone(), config.common.retry_count, tx, stop.clone()));
            }
        }
        "grpc" => {
            let grpc = config.grpc.clone().expect("validated: grpc section present for grpc mode");
            let certs: Vec<_> = config.certs.iter().map(certdx_client::WatchingCert::from_config).collect();
            tasks.push(certdx_client::spawn_failover_driver(config.common.clone(), grpc, certs, senders, stop.clone()));
        }
        other => return Err(anyhow::anyhow!("unknown client mode: {other}")),
    }

    wait_for_shutdown().await;
    stop.cancel();
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

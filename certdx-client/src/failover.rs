//! gRPC mode failover state machine (spec §4.8.2): five states driven by a
//! single task pulling transitions off a channel, with a swapped
//! cancellation token standing in for the source's "close channel, make a
//! new one" reset broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use certdx_config::client::{ClientCommonConfig, ClientGrpcConfig};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::grpc_client::run_stream;
use crate::watcher::{CertData, WatchingCert};

const LIVED_RESET_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const MAIN_RETRY_SLEEP: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stop,
    Main,
    Failover,
    TryFallback,
    RestartMain,
}

pub struct FailoverDriver {
    common: ClientCommonConfig,
    grpc: ClientGrpcConfig,
    certs: Vec<WatchingCert>,
    senders: HashMap<String, mpsc::Sender<CertData>>,
    process_stop: CancellationToken,
    reset: CancellationToken,
    standby_active: bool,
    standby_task: Option<(JoinHandle<()>, CancellationToken)>,
}

impl FailoverDriver {
    pub fn new(
        common: ClientCommonConfig,
        grpc: ClientGrpcConfig,
        certs: Vec<WatchingCert>,
        senders: HashMap<String, mpsc::Sender<CertData>>,
        process_stop: CancellationToken,
    ) -> Self {
        Self {
            common,
            grpc,
            certs,
            senders,
            process_stop,
            reset: CancellationToken::new(),
            standby_active: false,
            standby_task: None,
        }
    }

    /// Drives the state machine until `STOP`. `tx`/`rx` model the "single
    /// driver task pulling state values from a channel" (spec §4.8.2): each
    /// state handler runs to completion and pushes the next state back in.
    pub async fn run(mut self) {
        let (tx, mut rx) = mpsc::channel::<State>(4);
        let _ = tx.send(State::Main).await;

        while let Some(state) = rx.recv().await {
            if self.process_stop.is_cancelled() {
                self.enter_stop().await;
                return;
            }

            let next = match state {
                State::Stop => {
                    self.enter_stop().await;
                    return;
                }
                State::Main => self.run_main().await,
                State::Failover => self.run_failover().await,
                State::TryFallback => self.run_try_fallback().await,
                State::RestartMain => self.run_restart_main().await,
            };

            if tx.send(next).await.is_err() {
                return;
            }
        }
    }

    async fn enter_stop(&mut self) {
        info!("client failover driver stopping");
        self.reset.cancel();
        if let Some((handle, token)) = self.standby_task.take() {
            token.cancel();
            handle.abort();
        }
    }

    fn retry_budget(&self) -> u32 {
        self.common.retry_count
    }

    fn reconnect_interval(&self) -> Duration {
        self.common.reconnect_interval_duration()
    }

    async fn run_main(&mut self) -> State {
        let mut retry = 0u32;
        loop {
            if self.process_stop.is_cancelled() {
                return State::Stop;
            }

            let started = Instant::now();
            let received = Arc::new(Notify::new());
            let result = run_stream(&self.grpc.main, &self.certs, &self.senders, received, &self.reset).await;

            if self.process_stop.is_cancelled() || self.reset.is_cancelled() {
                return State::Stop;
            }
            if let Err(e) = &result {
                warn!(error = %e, "main gRPC stream ended");
            }

            if started.elapsed() > LIVED_RESET_THRESHOLD {
                retry = 0;
                continue;
            }

            retry += 1;
            if retry <= self.retry_budget() {
                tokio::select! {
                    _ = self.process_stop.cancelled() => return State::Stop,
                    _ = tokio::time::sleep(MAIN_RETRY_SLEEP) => {}
                }
                continue;
            }

            return if self.grpc.standby.is_some() && !self.standby_active {
                State::Failover
            } else {
                State::RestartMain
            };
        }
    }

    async fn run_failover(&mut self) -> State {
        let Some(standby) = self.grpc.standby.clone() else { return State::RestartMain };

        self.standby_active = true;
        let standby_token = CancellationToken::new();
        let certs = self.certs.clone();
        let senders = self.senders.clone();
        let retry_budget = self.retry_budget();
        let reconnect_interval = self.reconnect_interval();
        let process_stop = self.process_stop.clone();
        let token_for_task = standby_token.clone();

        let handle = tokio::spawn(async move {
            run_standby_loop(standby, certs, senders, retry_budget, reconnect_interval, process_stop, token_for_task).await;
        });

        self.standby_task = Some((handle, standby_token));
        State::TryFallback
    }

    async fn run_try_fallback(&mut self) -> State {
        let received = Arc::new(Notify::new());
        let main = self.grpc.main.clone();
        let certs = self.certs.clone();
        let senders = self.senders.clone();
        let reconnect_interval = self.reconnect_interval();
        let process_stop = self.process_stop.clone();
        let fallback_token = self.reset.clone();
        let received_for_task = received.clone();

        let probe = tokio::spawn(async move {
            loop {
                if process_stop.is_cancelled() || fallback_token.is_cancelled() {
                    return;
                }
                if run_stream(&main, &certs, &senders, received_for_task.clone(), &fallback_token).await.is_ok() {
                    return;
                }
                tokio::select! {
                    _ = process_stop.cancelled() => return,
                    _ = fallback_token.cancelled() => return,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
            }
        });

        tokio::select! {
            _ = self.process_stop.cancelled() => {
                probe.abort();
                return State::Stop;
            }
            _ = received.notified() => {}
        }

        info!("main gRPC connection recovered, falling back from standby");
        probe.abort();
        self.reset.cancel();
        self.reset = CancellationToken::new();
        if let Some((handle, token)) = self.standby_task.take() {
            token.cancel();
            handle.abort();
        }
        self.standby_active = false;
        State::RestartMain
    }

    async fn run_restart_main(&mut self) -> State {
        tokio::select! {
            _ = self.process_stop.cancelled() => State::Stop,
            _ = tokio::time::sleep(self.reconnect_interval()) => State::Main,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_standby_loop(
    standby: certdx_config::client::ClientGrpcServer,
    certs: Vec<WatchingCert>,
    senders: HashMap<String, mpsc::Sender<CertData>>,
    retry_budget: u32,
    reconnect_interval: Duration,
    process_stop: CancellationToken,
    stop: CancellationToken,
) {
    let mut retry = 0u32;
    loop {
        if process_stop.is_cancelled() || stop.is_cancelled() {
            return;
        }

        let started = Instant::now();
        let received = Arc::new(Notify::new());
        let result = run_stream(&standby, &certs, &senders, received, &stop).await;
        if process_stop.is_cancelled() || stop.is_cancelled() {
            return;
        }
        if let Err(e) = &result {
            warn!(error = %e, "standby gRPC stream ended");
        }

        if started.elapsed() > LIVED_RESET_THRESHOLD {
            retry = 0;
            continue;
        }

        retry += 1;
        let sleep_for = if retry <= retry_budget { MAIN_RETRY_SLEEP } else { reconnect_interval };
        if retry > retry_budget {
            retry = 0;
        }

        tokio::select! {
            _ = process_stop.cancelled() => return,
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

pub fn spawn_failover_driver(
    common: ClientCommonConfig,
    grpc: ClientGrpcConfig,
    certs: Vec<WatchingCert>,
    senders: HashMap<String, mpsc::Sender<CertData>>,
    process_stop: CancellationToken,
) -> JoinHandle<()> {
    let driver = FailoverDriver::new(common, grpc, certs, senders, process_stop);
    tokio::spawn(driver.run())
}

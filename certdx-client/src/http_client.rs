//! HTTP poll mode (spec §4.8.1): one poller per watched cert, main/standby
//! fallback via the shared retry primitive.

use std::time::Duration;

use base64::Engine;
use certdx_common::retry::retry;
use certdx_common::error::Error;
use certdx_config::client::ClientHttpConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::watcher::{CertData, WatchingCert};

#[derive(Debug, Serialize)]
struct CertRequest<'a> {
    domains: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CertResponse {
    Ok {
        #[serde(rename = "renewTimeLeft")]
        renew_time_left: i64,
        fullchain: String,
        key: String,
    },
    Err {
        err: String,
    },
}

struct PollResult {
    sleep_for: Duration,
    data: Option<CertData>,
}

async fn poll_once(client: &reqwest::Client, server: &certdx_config::client::ClientHttpServer, cert: &WatchingCert) -> Result<PollResult, Error> {
    let mut request = client.post(&server.url).json(&CertRequest { domains: &cert.domains });
    if !server.token.is_empty() {
        request = request.bearer_auth(&server.token);
    }

    let response = request.send().await.map_err(|e| Error::StreamIo(format!("http request to {} failed: {e}", server.url)))?;
    if !response.status().is_success() {
        return Err(Error::StreamIo(format!("http request to {} returned {}", server.url, response.status())));
    }

    let body: CertResponse = response.json().await.map_err(|e| Error::StreamIo(format!("decoding response from {}: {e}", server.url)))?;

    match body {
        CertResponse::Err { err } => {
            warn!(name = %cert.name, server = %server.url, error = %err, "server reported an error");
            Ok(PollResult { sleep_for: Duration::from_secs(15), data: None })
        }
        CertResponse::Ok { renew_time_left, fullchain, key } => {
            let fullchain = base64::engine::general_purpose::STANDARD
                .decode(fullchain)
                .map_err(|e| Error::StreamIo(format!("decoding fullchain: {e}")))?;
            let key = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|e| Error::StreamIo(format!("decoding key: {e}")))?;

            let sleep_ns = (renew_time_left.max(0) as u64) / 4;
            Ok(PollResult {
                sleep_for: Duration::from_nanos(sleep_ns).max(Duration::from_secs(1)),
                data: Some(CertData { domains: cert.domains.clone(), fullchain, key }),
            })
        }
    }
}

/// Spawns the per-cert HTTP poller. Delivers updates on `tx`; honors `stop`
/// during both the retry dwell and the post-success sleep.
pub fn spawn_http_poller(cert: WatchingCert, http: ClientHttpConfig, retry_count: u32, tx: mpsc::Sender<CertData>, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        loop {
            if stop.is_cancelled() {
                return;
            }

            let result = retry(retry_count, || poll_once(&client, &http.main, &cert)).await;

            let result = match result {
                Ok(r) => Ok(r),
                Err(main_err) => {
                    if let Some(standby) = &http.standby {
                        warn!(name = %cert.name, error = %main_err, "main server exhausted, trying standby");
                        retry(retry_count, || poll_once(&client, standby, &cert)).await
                    } else {
                        Err(main_err)
                    }
                }
            };

            let sleep_for = match result {
                Ok(PollResult { sleep_for, data: Some(data) }) => {
                    debug!(name = %cert.name, "delivering updated certificate to watcher");
                    if tx.send(data).await.is_err() {
                        return;
                    }
                    sleep_for
                }
                Ok(PollResult { sleep_for, data: None }) => sleep_for,
                Err(e) => {
                    warn!(name = %cert.name, error = %e, "both main and standby failed, backing off");
                    Duration::from_secs(15)
                }
            };

            tokio::select! {
                _ = stop.cancelled() => {
                    info!(name = %cert.name, "http poller stopped");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    })
}

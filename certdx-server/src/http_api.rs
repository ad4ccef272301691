//! HTTP pull API (spec §4.6), a raw `hyper` server in the style of the
//! teacher's admin API rather than a router framework.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use certdx_acme::challenge::MemoryHttp01Solver;
use certdx_cache::{CacheEntry, CertCache};
use certdx_common::domain::domains_allowed;
use certdx_common::error::{Error, Result as CertdxResult};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpApiState {
    pub cache: CertCache,
    pub allowed_domains: Vec<String>,
    pub api_path: String,
    /// Empty means no auth.
    pub token: String,
    pub renew_time_left_ns: i64,
    pub challenge_solver: Arc<MemoryHttp01Solver>,
}

#[derive(Deserialize)]
struct CertRequest {
    domains: Vec<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum CertResponse {
    Ok { #[serde(rename = "renewTimeLeft")] renew_time_left: i64, fullchain: String, key: String },
    Err { err: String },
}

pub async fn run_http_api(addr: SocketAddr, state: HttpApiState) -> CertdxResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP pull API listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "accept error on HTTP pull API");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle(req, state.clone())))
                .await
            {
                error!(error = %e, "error serving HTTP pull API connection");
            }
        });
    }
}

/// HTTPS variant of the pull API (spec §4.6): the listener's own TLS
/// certificate is read from `server_entry`, the cache entry for the
/// server's own name (`http.names`). Restarted (old listener dropped, new
/// keypair loaded, reopened on the same address) whenever that entry
/// publishes a new version.
pub async fn run_https_api(addr: SocketAddr, state: HttpApiState, server_entry: Arc<CacheEntry>) -> CertdxResult<()> {
    let mut updated = server_entry.updated();

    loop {
        let cert = server_entry.cert().await;
        let tls_config = build_tls_config(&cert)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "HTTPS pull API listening");

        let state = state.clone();
        let acceptor = acceptor.clone();
        let serving = async {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "accept error on HTTPS pull API");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::task::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "TLS handshake failed on HTTPS pull API");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(move |req| handle(req, state.clone())))
                        .await
                    {
                        error!(error = %e, "error serving HTTPS pull API connection");
                    }
                });
            }
        };

        tokio::select! {
            _ = serving => {}
            result = updated.changed() => {
                if result.is_err() {
                    return Ok(());
                }
                info!(%addr, "server's own certificate renewed, restarting HTTPS listener");
            }
        }
    }
}

fn build_tls_config(cert: &certdx_common::Cert) -> CertdxResult<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut cert.fullchain.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigInvalid(format!("invalid server certificate chain: {e}")))?;
    let key = rustls_pemfile::private_key(&mut cert.key.as_slice())
        .map_err(|e| Error::ConfigInvalid(format!("invalid server private key: {e}")))?
        .ok_or_else(|| Error::ConfigInvalid("no private key found in server certificate material".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::ConfigInvalid(format!("building HTTPS listener TLS config failed: {e}")))?;
    Ok(Arc::new(config))
}

async fn handle(req: Request<hyper::body::Incoming>, state: HttpApiState) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
        return Ok(match state.challenge_solver.get(token).await {
            Some(key_auth) => Response::new(Full::new(Bytes::from(key_auth))),
            None => not_found(),
        });
    }

    if req.method() != Method::POST || path != state.api_path {
        return Ok(not_found());
    }

    if !state.token.is_empty() {
        let authorized = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Token {}", state.token))
            .unwrap_or(false);
        if !authorized {
            warn!("HTTP pull API request failed token authorization");
            return Ok(not_found());
        }
    }

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(internal_error()),
    };

    let request: CertRequest = match serde_json::from_slice(&body_bytes) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed cert request body");
            return Ok(internal_error());
        }
    };

    if !domains_allowed(&request.domains, &state.allowed_domains) {
        return Ok(json_response(StatusCode::OK, &CertResponse::Err { err: "Domains not allowed".to_string() }));
    }

    let entry = state.cache.get_or_create(&request.domains).await;
    let cert = if entry.subscriber_count() == 0 {
        match state.cache.renew_inline(&entry).await {
            Ok(cert) => cert,
            Err(e) => {
                error!(error = %e, "inline renewal failed for HTTP pull API request");
                return Ok(internal_error());
            }
        }
    } else {
        entry.cert().await
    };

    Ok(json_response(
        StatusCode::OK,
        &CertResponse::Ok {
            renew_time_left: state.renew_time_left_ns,
            fullchain: STANDARD.encode(&cert.fullchain),
            key: STANDARD.encode(&cert.key),
        },
    ))
}

fn json_response(status: StatusCode, body: &CertResponse) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::new())).unwrap()
}

fn internal_error() -> Response<Full<Bytes>> {
    Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Full::new(Bytes::new())).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_domain_response_matches_the_client_contract() {
        let body = CertResponse::Err { err: "Domains not allowed".to_string() };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"err":"Domains not allowed"}"#);
    }

    #[test]
    fn ok_response_carries_base64_material_and_renew_time() {
        let body = CertResponse::Ok {
            renew_time_left: 86400,
            fullchain: STANDARD.encode(b"chain"),
            key: STANDARD.encode(b"key"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["renewTimeLeft"], 86400);
        assert_eq!(json["fullchain"], STANDARD.encode(b"chain"));
    }
}

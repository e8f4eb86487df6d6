//! Test helpers: a scriptable local upstream server and state builders.

use crate::config::Settings;
use crate::dispatch::AppState;
use crate::http::ProxyBody;
use crate::mode::Mode;
use crate::servers::ServersConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Scripted behavior of a [`TestUpstream`].
#[derive(Clone, Copy)]
enum Behavior {
    /// Respond 200 with the request target as the body.
    EchoUri,
    /// Respond 200 with the request body echoed back.
    EchoBody,
    /// Respond 200 with a fixed `application/json` body.
    Json(&'static str),
    /// Respond 200 with a fixed `text/plain` body.
    Text(&'static str),
    /// Respond `409` for the first `conflicts` requests, then the given
    /// status with a fixed body and an `x-test-upstream` marker header.
    ConflictsThen {
        conflicts: usize,
        status: u16,
        body: &'static str,
    },
}

/// A real HTTP/1.1 upstream bound to an ephemeral local port.
pub struct TestUpstream {
    url: String,
    hits: Arc<AtomicUsize>,
    last_target: Arc<Mutex<String>>,
    last_body: Arc<Mutex<String>>,
}

impl TestUpstream {
    pub async fn echo_uri() -> Self {
        Self::start(Behavior::EchoUri).await
    }

    pub async fn echo_body() -> Self {
        Self::start(Behavior::EchoBody).await
    }

    pub async fn json(body: &'static str) -> Self {
        Self::start(Behavior::Json(body)).await
    }

    pub async fn text(body: &'static str) -> Self {
        Self::start(Behavior::Text(body)).await
    }

    pub async fn conflicts_then(conflicts: usize, status: u16, body: &'static str) -> Self {
        Self::start(Behavior::ConflictsThen { conflicts, status, body }).await
    }

    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test upstream");
        let port = listener.local_addr().unwrap().port();

        let hits = Arc::new(AtomicUsize::new(0));
        let last_target = Arc::new(Mutex::new(String::new()));
        let last_body = Arc::new(Mutex::new(String::new()));

        let svc_hits = hits.clone();
        let svc_last_target = last_target.clone();
        let svc_last_body = last_body.clone();
        let svc = service_fn(move |request: Request<Incoming>| {
            let hits = svc_hits.clone();
            let last_target = svc_last_target.clone();
            let last_body = svc_last_body.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                let target = request.uri().to_string();
                *last_target.lock() = target.clone();
                let body_bytes = request
                    .into_body()
                    .collect()
                    .await
                    .map(|collected| collected.to_bytes())
                    .unwrap_or_default();
                *last_body.lock() = String::from_utf8_lossy(&body_bytes).into_owned();

                let response = match behavior {
                    Behavior::EchoUri => Response::new(Full::new(Bytes::from(target))),
                    Behavior::EchoBody => Response::new(Full::new(body_bytes)),
                    Behavior::Json(body) => Response::builder()
                        .header("content-type", "application/json")
                        .body(Full::new(Bytes::from_static(body.as_bytes())))
                        .unwrap(),
                    Behavior::Text(body) => Response::builder()
                        .header("content-type", "text/plain")
                        .body(Full::new(Bytes::from_static(body.as_bytes())))
                        .unwrap(),
                    Behavior::ConflictsThen { conflicts, status, body } => {
                        if n < conflicts {
                            Response::builder()
                                .status(409)
                                .body(Full::new(Bytes::from_static(b"conflict")))
                                .unwrap()
                        } else {
                            Response::builder()
                                .status(status)
                                .header("x-test-upstream", "yes")
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap()
                        }
                    }
                };
                Ok::<_, Infallible>(response)
            }
        });

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let svc = svc.clone();
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await;
                });
            }
        });

        Self {
            url: format!("http://127.0.0.1:{port}/"),
            hits,
            last_target,
            last_body,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_target(&self) -> String {
        self.last_target.lock().clone()
    }

    pub fn last_body(&self) -> String {
        self.last_body.lock().clone()
    }
}

pub fn test_settings(mode: Mode) -> Settings {
    Settings {
        config_file: "apiproxy.conf".into(),
        port: 0,
        proxy_timeout: Duration::from_secs(5),
        socket_timeout: Duration::from_secs(5),
        statsd: None,
        mode,
    }
}

/// Builds dispatch state with a routing plane parsed from `config_text`.
pub fn test_state(mode: Mode, config_text: &str) -> AppState {
    let state = AppState::new(&test_settings(mode));
    let config = ServersConfig::from_bytes(config_text.as_bytes()).expect("bad test config");
    state.publish(Arc::new(config));
    state
}

/// Reads a whole proxy response body as UTF-8.
pub async fn collect_response(response: Response<ProxyBody>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to collect response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("response body is not UTF-8")
}

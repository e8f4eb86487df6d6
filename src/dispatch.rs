//! Request dispatching: classify the path, pick the upstream, forward.
//!
//! All requests flow through [`AppState::handle`]. The state owns the one
//! mutable cell in the process, the current [`ServersConfig`]; every request
//! captures an `Arc` of it at entry and keeps using that snapshot for its
//! whole lifetime, while the watcher may publish a replacement at any time.

use crate::config::Settings;
use crate::enumerate::{ENUMERATE_BUFFER_LIMIT, RewriteInputs, rewrite_page, traversal_version};
use crate::errors::ApiProxyError;
use crate::http::{
    BufferedBody, ProxyBody, ProxyClient, buffer_body, build_client, cannot_forward_response,
    forward_to_upstream, full_body, text_response,
};
use crate::metrics_defs::{CONFIG_RELOADS, REQUESTS_REJECTED, UPSTREAM_REQUEST_DURATION};
use crate::mode::{Mode, ShardedMatch};
use crate::servers::ServersConfig;
use crate::sharding::{parse_i64, shard_key};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use parking_lot::RwLock;
use rand::Rng;
use std::convert::Infallible;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

/// Process-wide dispatch state.
pub struct AppState {
    mode: Mode,
    proxy_timeout: Duration,
    client: ProxyClient,
    current: RwLock<Option<Arc<ServersConfig>>>,
}

/// Computes the sharding key selecting the upstream for a path.
///
/// Sharded paths hash their entity ids; an id that fails to parse makes the
/// whole path unroutable. Global paths hash a random id, spreading them
/// uniformly over the fleet. Everything else is unroutable.
pub fn sharding_key_for(mode: &Mode, path: &str) -> Option<u32> {
    if let Some(captured) = mode.match_sharded(path) {
        return match captured {
            ShardedMatch::One(id) => parse_i64(id).map(|id| shard_key(id, None)),
            ShardedMatch::Two(first, second) => match (parse_i64(first), parse_i64(second)) {
                (Some(first), Some(second)) => Some(shard_key(first, Some(second))),
                _ => None,
            },
        };
    }
    if mode.matches_global(path) {
        let id = rand::thread_rng().gen_range(0..1_000_000_000_i64);
        return Some(shard_key(id, None));
    }
    None
}

impl AppState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            mode: settings.mode,
            proxy_timeout: settings.proxy_timeout,
            client: build_client(settings.socket_timeout),
            current: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn client(&self) -> &ProxyClient {
        &self.client
    }

    pub fn proxy_timeout(&self) -> Duration {
        self.proxy_timeout
    }

    /// Captures the current routing plane, if one has been loaded.
    pub fn current_config(&self) -> Option<Arc<ServersConfig>> {
        self.current.read().clone()
    }

    /// Atomically replaces the routing plane. In-flight requests keep the
    /// snapshot they captured.
    pub fn publish(&self, config: Arc<ServersConfig>) {
        *self.current.write() = Some(config);
    }

    /// Loads the config file and publishes it; on failure the previous
    /// plane stays in place.
    pub fn reload_from(&self, path: &Path) {
        match ServersConfig::from_file(path) {
            Ok(config) => {
                metrics::counter!(CONFIG_RELOADS.name, "outcome" => "ok").increment(1);
                tracing::info!(
                    version = config.version(),
                    servers = config.server_count(),
                    "Server configuration loaded"
                );
                self.publish(Arc::new(config));
            }
            Err(error) => {
                metrics::counter!(CONFIG_RELOADS.name, "outcome" => "error").increment(1);
                tracing::error!(
                    %error,
                    path = %path.display(),
                    "Failed to load server configuration, keeping the previous one"
                );
            }
        }
    }

    /// Serves one client request.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let request = request
            .map(|body| body.map_err(|e| ApiProxyError::RequestBodyError(e.to_string())).boxed());
        let path = request.uri().path().to_string();

        let Some(config) = self.current_config() else {
            tracing::warn!(path = %path, "No server configuration loaded");
            return cannot_forward_response();
        };
        if self.mode.reserve_path() == Some(path.as_str()) {
            return self.handle_reserve(request).await;
        }
        let Some(key) = sharding_key_for(&self.mode, &path) else {
            metrics::counter!(REQUESTS_REJECTED.name).increment(1);
            tracing::debug!(path = %path, "Path matches no known pattern");
            return cannot_forward_response();
        };
        let upstream = config.route_key(key).clone();

        if self.mode.is_enumerate(&path) {
            let snapshot_version = config.version().to_string();
            return self.handle_enumerate(request, upstream, snapshot_version).await;
        }
        self.forward_streaming(request, &upstream).await
    }

    /// Forwards a request and streams the upstream response back.
    async fn forward_streaming(
        &self,
        request: Request<ProxyBody>,
        upstream: &Url,
    ) -> Response<ProxyBody> {
        let start = Instant::now();
        let result = forward_to_upstream(&self.client, upstream, request, self.proxy_timeout).await;
        let status = match &result {
            Ok(response) => response.status().as_u16().to_string(),
            Err(ApiProxyError::UpstreamTimeout(_)) => "timeout".to_string(),
            Err(_) => "error".to_string(),
        };
        metrics::histogram!(UPSTREAM_REQUEST_DURATION.name, "status" => status)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => response.map(|body| body.map_err(ApiProxyError::Hyper).boxed()),
            Err(error) => {
                tracing::warn!(%error, %upstream, "Upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, error.to_string())
            }
        }
    }

    /// Forwards an enumerate request, buffering and rewriting the page the
    /// upstream returns.
    async fn handle_enumerate(
        &self,
        request: Request<ProxyBody>,
        upstream: Url,
        snapshot_version: String,
    ) -> Response<ProxyBody> {
        let request_query = request.uri().query().map(|q| q.to_string());
        let response =
            match forward_to_upstream(&self.client, &upstream, request, self.proxy_timeout).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%error, %upstream, "Upstream request failed");
                    return text_response(StatusCode::BAD_GATEWAY, error.to_string());
                }
            };

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                value.split(';').next().unwrap_or("").trim() == "application/json"
            });
        if response.status() != StatusCode::OK || !is_json {
            return response.map(|body| body.map_err(ApiProxyError::Hyper).boxed());
        }

        let (mut parts, body) = response.into_parts();
        let buffered =
            match timeout(self.proxy_timeout, buffer_body(body, ENUMERATE_BUFFER_LIMIT)).await {
                Ok(Ok(buffered)) => buffered,
                Ok(Err(error)) => {
                    tracing::warn!(%error, %upstream, "Failed to read enumerate response");
                    return text_response(StatusCode::BAD_GATEWAY, error.to_string());
                }
                Err(_) => {
                    let error = ApiProxyError::UpstreamTimeout(upstream.to_string());
                    return text_response(StatusCode::BAD_GATEWAY, error.to_string());
                }
            };
        let bytes = match buffered {
            BufferedBody::Complete(bytes) => bytes,
            BufferedBody::Overflow(body) => {
                tracing::warn!(
                    limit = ENUMERATE_BUFFER_LIMIT,
                    %upstream,
                    "Enumerate response exceeds the buffer limit, relaying unmodified"
                );
                return Response::from_parts(parts, body);
            }
        };

        let current = self.current_config();
        let request_version = traversal_version(request_query.as_deref());
        let inputs = RewriteInputs {
            traversal_version: request_version.as_deref(),
            snapshot_version: &snapshot_version,
            forward_url: &upstream,
            current: current.as_deref(),
        };
        match rewrite_page(&self.mode, &bytes, &inputs) {
            Some(rewritten) => {
                parts.headers.remove(CONTENT_LENGTH);
                Response::from_parts(parts, full_body(rewritten))
            }
            None => {
                tracing::debug!(%upstream, "Enumerate payload has an unexpected shape, relaying unchanged");
                Response::from_parts(parts, full_body(bytes))
            }
        }
    }
}

/// Hyper service wrapping the shared dispatch state.
#[derive(Clone)]
pub struct ApiProxyService {
    state: Arc<AppState>,
}

impl ApiProxyService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl<B> Service<Request<B>> for ApiProxyService
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<B>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.handle(request).await) })
    }
}

//! Upstream HTTP plumbing shared by all forwarding paths.
//!
//! One keep-alive client pool serves every upstream. Requests and responses
//! get hop-by-hop headers stripped and a `Via` header appended in both
//! directions. Response bodies are streamed through unless a caller needs
//! them buffered (enumerate rewriting, reservation relaying); buffering is
//! capped, and on overflow the already-buffered prefix is replayed ahead of
//! the live stream so the bytes still reach the client unmodified.

use crate::errors::ApiProxyError;
use bytes::{Bytes, BytesMut};
use http::Version;
use http::header::{
    CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, ApiProxyError>;

/// Shared upstream client with keep-alive pooling.
pub type ProxyClient = Client<HttpConnector, ProxyBody>;

/// Builds the shared upstream client. `idle_timeout` bounds how long pooled
/// connections may sit unused.
pub fn build_client(idle_timeout: Duration) -> ProxyClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_timeout)
        .build(HttpConnector::new())
}

/// Wraps a fully materialized byte payload as a [`ProxyBody`].
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// The canonical answer for anything the proxy can not route.
pub fn cannot_forward_response() -> Response<ProxyBody> {
    text_response(
        StatusCode::BAD_GATEWAY,
        "The request can not be forwarded to an Web API server.\n",
    )
}

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

fn is_http1(version: Version) -> bool {
    matches!(version, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Strips hop-by-hop headers before forwarding, in either direction.
///
/// HTTP/2+ carries no hop-by-hop headers, so only HTTP/1.x messages are
/// touched: the standard set, anything named by the `Connection` header,
/// and `keep-alive` on pre-1.1 versions.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    if !is_http1(version) {
        return;
    }
    let mut extra_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION)
        && let Ok(value) = connection.to_str()
    {
        for token in value.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                extra_drops.push(name);
            }
        }
    }
    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    for name in extra_drops {
        headers.remove(&name);
    }
    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}

/// Appends this proxy to the `Via` chain.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => return,
    };
    let via_value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {version_str} apiproxy"),
        None => format!("{version_str} apiproxy"),
    };
    if let Ok(value) = HeaderValue::from_str(&via_value) {
        headers.insert(VIA, value);
    }
}

/// Sends a request to the given upstream, waiting at most `response_timeout`
/// for the response head. The response body is returned still streaming.
pub async fn forward_to_upstream(
    client: &ProxyClient,
    upstream_url: &Url,
    request: Request<ProxyBody>,
    response_timeout: Duration,
) -> Result<Response<Incoming>, ApiProxyError> {
    let upstream_identifier = upstream_url
        .host_str()
        .unwrap_or(upstream_url.as_str())
        .to_string();

    let path_and_query = match request.uri().path_and_query() {
        Some(pq) => pq.as_str(),
        None => "/",
    };
    let mut url = upstream_url.clone();
    if let Some((path, query)) = path_and_query.split_once('?') {
        url.set_path(path);
        url.set_query(Some(query));
    } else {
        url.set_path(path_and_query);
        url.set_query(None);
    }

    let (mut parts, body) = request.into_parts();
    filter_hop_by_hop(&mut parts.headers, parts.version);
    add_via_header(&mut parts.headers, parts.version);

    let mut builder = Request::builder().method(parts.method).uri(url.as_str());
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let upstream_request = builder
        .body(body)
        .map_err(|e| ApiProxyError::RequestBuildError(e.to_string()))?;

    let response = timeout(response_timeout, client.request(upstream_request))
        .await
        .map_err(|_| ApiProxyError::UpstreamTimeout(upstream_identifier.clone()))?
        .map_err(|e| ApiProxyError::UpstreamRequestFailed(upstream_identifier, e.to_string()))?;

    let (mut parts, body) = response.into_parts();
    filter_hop_by_hop(&mut parts.headers, parts.version);
    add_via_header(&mut parts.headers, parts.version);
    Ok(Response::from_parts(parts, body))
}

/// Collects a streaming body into memory.
pub async fn collect_body(body: Incoming) -> Result<Bytes, ApiProxyError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ApiProxyError::ResponseBodyError(e.to_string()))
}

/// Outcome of buffering a body under a size cap.
pub enum BufferedBody {
    /// The whole body fit under the cap.
    Complete(Bytes),
    /// The cap was hit; the body replays the buffered prefix and then the
    /// rest of the live stream.
    Overflow(ProxyBody),
}

/// Buffers a streaming body, giving up once more than `cap` bytes arrive.
pub async fn buffer_body(mut body: Incoming, cap: usize) -> Result<BufferedBody, ApiProxyError> {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ApiProxyError::ResponseBodyError(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if collected.len() + data.len() > cap {
                collected.extend_from_slice(&data);
                return Ok(BufferedBody::Overflow(
                    ReplayBody {
                        prefix: Some(collected.freeze()),
                        rest: body,
                    }
                    .boxed(),
                ));
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok(BufferedBody::Complete(collected.freeze()))
}

/// Replays an already-buffered prefix, then the remainder of the upstream
/// body.
struct ReplayBody {
    prefix: Option<Bytes>,
    rest: Incoming,
}

impl Body for ReplayBody {
    type Data = Bytes;
    type Error = ApiProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(prefix) = this.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        Pin::new(&mut this.rest)
            .poll_frame(cx)
            .map(|frame| frame.map(|result| result.map_err(ApiProxyError::Hyper)))
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let mut hint = self.rest.size_hint();
        if let Some(prefix) = &self.prefix {
            hint.set_lower(hint.lower() + prefix.len() as u64);
            if let Some(upper) = hint.upper() {
                hint.set_upper(upper + prefix.len() as u64);
            }
        }
        hint
    }
}

//! Reservation of new entity ids at random positions in the proxy's
//! assigned interval.
//!
//! A reservation request does not name an id; the proxy draws one from a
//! cryptographic source, asks the owning backend to reserve it, and retries
//! on `409 Conflict` (the id already exists). Any other backend answer is
//! relayed to the client verbatim.

use crate::dispatch::{AppState, sharding_key_for};
use crate::http::{
    ProxyBody, cannot_forward_response, collect_body, forward_to_upstream, full_body,
    text_response,
};
use crate::metrics_defs::RESERVE_ATTEMPTS;
use crate::sharding::to_unsigned;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode, Uri};
use rand::{RngCore, rngs::OsRng};
use tokio::time::timeout;

/// Consecutive conflicts tolerated before giving up.
pub const MAX_RESERVE_ATTEMPTS: u32 = 100;

/// Draws an id from the inclusive interval using OS randomness.
///
/// 8 random bytes are read big-endian and reduced modulo the interval span,
/// then offset by the lower bound; the full-interval case degenerates to the
/// raw value.
pub fn random_id_in(min_id: i64, max_id: i64) -> i64 {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    let raw = u64::from_be_bytes(buf);
    let span = max_id.wrapping_sub(min_id) as u64;
    let offset = if span == u64::MAX { raw } else { raw % (span + 1) };
    min_id.wrapping_add(offset as i64)
}

impl AppState {
    /// Serves a reservation request: draw, POST, retry on conflict.
    pub(crate) async fn handle_reserve(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        let mode = *self.mode();
        let (Some((min_id, max_id)), Some(reservation_type)) =
            (mode.id_interval(), mode.reservation_type())
        else {
            return cannot_forward_response();
        };

        // The client's headers travel with every attempt; its body is
        // replaced, so the body-framing headers go too.
        let (parts, _client_body) = request.into_parts();
        let mut base_headers = parts.headers;
        base_headers.remove(CONTENT_LENGTH);
        base_headers.remove(TRANSFER_ENCODING);
        base_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body_json = serde_json::json!({ "type": reservation_type }).to_string();

        let mut attempts = 0u32;
        for attempt in 1..=MAX_RESERVE_ATTEMPTS {
            attempts = attempt;
            let id = random_id_in(min_id, max_id);
            let path = mode.reserve_forward_path(to_unsigned(id));

            let Some(config) = self.current_config() else {
                break;
            };
            let Some(key) = sharding_key_for(&mode, &path) else {
                break;
            };
            let upstream = config.route_key(key).clone();

            let Ok(uri) = path.parse::<Uri>() else {
                break;
            };
            let mut attempt_request = Request::new(full_body(body_json.clone()));
            *attempt_request.method_mut() = Method::POST;
            *attempt_request.uri_mut() = uri;
            *attempt_request.headers_mut() = base_headers.clone();

            match forward_to_upstream(
                self.client(),
                &upstream,
                attempt_request,
                self.proxy_timeout(),
            )
            .await
            {
                Ok(response) if response.status() == StatusCode::CONFLICT => {
                    tracing::debug!(id, "Reserved id already exists, drawing another");
                }
                Ok(response) => {
                    let (mut parts, body) = response.into_parts();
                    let bytes = match timeout(self.proxy_timeout(), collect_body(body)).await {
                        Ok(Ok(bytes)) => bytes,
                        _ => break,
                    };
                    parts.headers.remove(CONTENT_LENGTH);
                    metrics::histogram!(RESERVE_ATTEMPTS.name).record(attempt as f64);
                    return Response::from_parts(parts, full_body(bytes));
                }
                Err(error) => {
                    tracing::warn!(%error, %upstream, "Reservation attempt failed");
                    break;
                }
            }
        }
        metrics::histogram!(RESERVE_ATTEMPTS.name).record(attempts as f64);
        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("All {reservation_type} attempts have failed.\n"),
        )
    }
}

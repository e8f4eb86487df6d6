//! Rewriting of per-shard enumeration pages into a fleet-wide chain.
//!
//! Backends paginate entity ids one shard at a time: a page of type
//! `ObjectReferencesPage` carries its own `uri` and, while the shard has
//! more pages, a `next` link. The proxy stitches the shards together by
//! pointing `next` at the successor server's smallest owned id whenever a
//! shard ends, and threads a `v=<config version>` query parameter through
//! the whole traversal so that a reconfiguration mid-walk invalidates the
//! chain instead of silently skipping or repeating ids.

use crate::mode::Mode;
use crate::servers::ServersConfig;
use crate::sharding::to_unsigned;
use serde_json::Value;
use url::Url;

/// Hard cap on a buffered enumerate response body.
pub const ENUMERATE_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Everything the rewrite needs besides the page itself.
pub struct RewriteInputs<'a> {
    /// `v` query parameter of the client's request, if present.
    pub traversal_version: Option<&'a str>,
    /// Config version snapshotted when the request was dispatched.
    pub snapshot_version: &'a str,
    /// Upstream the request was forwarded to.
    pub forward_url: &'a Url,
    /// Routing plane current at response time.
    pub current: Option<&'a ServersConfig>,
}

/// Rewrites an `ObjectReferencesPage` payload, returning the new body.
///
/// Returns `None` when the payload is not a well-formed page (wrong type
/// tag, non-string `uri`, a present but non-string `next`, or not JSON at
/// all); the caller then relays the original bytes untouched.
pub fn rewrite_page(mode: &Mode, body: &[u8], inputs: &RewriteInputs<'_>) -> Option<Vec<u8>> {
    let mut page: Value = serde_json::from_slice(body).ok()?;
    let object = page.as_object_mut()?;
    if object.get("type")?.as_str()? != "ObjectReferencesPage" {
        return None;
    }
    let uri = object.get("uri")?.as_str()?.to_string();
    let next = match object.get("next") {
        None => None,
        Some(Value::String(next)) => Some(next.clone()),
        Some(_) => return None,
    };

    let version = inputs
        .traversal_version
        .unwrap_or(inputs.snapshot_version)
        .to_string();

    // The upstream returns `uri` without a query, so appending is enough.
    object.insert("uri".to_string(), Value::String(format!("{uri}?v={version}")));

    let consistent = version == inputs.snapshot_version
        && inputs
            .current
            .is_some_and(|current| current.version() == inputs.snapshot_version);
    if consistent {
        match next {
            Some(next) if !next.is_empty() => {
                object.insert(
                    "next".to_string(),
                    Value::String(format!("{next}?v={version}")),
                );
            }
            _ => {
                // End of this shard: chain to the successor's smallest id,
                // or end the traversal at the last server.
                let current = inputs.current?;
                match current.successor_of(inputs.forward_url) {
                    Some(successor) => {
                        let min_id = current.min_id(successor)?;
                        object.insert(
                            "next".to_string(),
                            Value::String(
                                mode.enumerate_path(to_unsigned(min_id), &version),
                            ),
                        );
                    }
                    None => {
                        object.remove("next");
                    }
                }
            }
        }
    } else {
        // The traversal straddles a reconfiguration: hand out a page that
        // terminates the walk and a link guaranteed to fail, forcing the
        // client to restart.
        object.insert("items".to_string(), Value::Array(Vec::new()));
        object.insert(
            "next".to_string(),
            Value::String(mode.invalid_path().to_string()),
        );
    }
    serde_json::to_vec(&page).ok()
}

/// Extracts the first `v` query parameter from a request query string.
pub fn traversal_version(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "v")
        .map(|(_, value)| value.into_owned())
}

//! The routing plane: an immutable snapshot of the server fleet.
//!
//! A [`ServersConfig`] is built from the raw bytes of the config file and
//! never mutated afterwards; the dispatcher captures an `Arc` of the current
//! snapshot at request entry, and the watcher publishes replacements
//! atomically. Besides the routing tree it precomputes the data needed for
//! fleet-wide pagination: the smallest id owned by each server and a total
//! order over the servers.

use crate::routes::{ServerRoute, parse_config_line};
use crate::sharding::{md5_hex, shard_key};
use crate::tree::{ServersTree, TreeBuildError};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid UTF-8")]
    NotUtf8,

    #[error(transparent)]
    Tree(#[from] TreeBuildError),
}

/// Immutable routing plane derived from one version of the config file.
#[derive(Debug)]
pub struct ServersConfig {
    tree: ServersTree,
    min_ids: HashMap<Url, i64>,
    first_server_url: Url,
    successor: HashMap<Url, Option<Url>>,
    version: String,
}

impl ServersConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Self::from_bytes(&raw)
    }

    /// Parses the raw config bytes into a routing plane.
    ///
    /// Blank lines are ignored; lines failing the route or URL parser are
    /// logged and skipped without rejecting the reload. The resulting route
    /// set must still cover the key space exactly.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(raw).map_err(|_| ConfigError::NotUtf8)?;
        let mut routes: Vec<ServerRoute> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_config_line(line) {
                Ok(route) => routes.push(route),
                Err(error) => {
                    tracing::warn!(line, %error, "Skipping malformed config line");
                }
            }
        }
        let tree = ServersTree::build(&routes)?;

        let mut urls: Vec<Url> = routes.iter().map(|r| r.url.clone()).collect();
        urls.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        urls.dedup();

        // Scan ids upward from the smallest until every server has been seen
        // with its minimum owned id. The tree covers the whole key space and
        // MD5 scatters consecutive ids, so this is a short coupon-collector
        // walk.
        let mut min_ids: HashMap<Url, i64> = HashMap::new();
        let mut first_server_url: Option<Url> = None;
        let mut id = i64::MIN;
        while min_ids.len() < urls.len() {
            let url = tree.match_sharding_key(shard_key(id, None));
            if first_server_url.is_none() {
                first_server_url = Some(url.clone());
            }
            if !min_ids.contains_key(url) {
                min_ids.insert(url.clone(), id);
            }
            id = id.wrapping_add(1);
        }
        let Some(first_server_url) = first_server_url else {
            return Err(ConfigError::Tree(TreeBuildError::NoRoutes));
        };

        let mut successor: HashMap<Url, Option<Url>> = HashMap::new();
        let mut chain = vec![first_server_url.clone()];
        chain.extend(urls.iter().filter(|u| **u != first_server_url).cloned());
        for pair in chain.windows(2) {
            successor.insert(pair[0].clone(), Some(pair[1].clone()));
        }
        if let Some(last) = chain.last() {
            successor.insert(last.clone(), None);
        }

        Ok(Self {
            tree,
            min_ids,
            first_server_url,
            successor,
            version: md5_hex(raw),
        })
    }

    /// Returns the server owning the given sharding key.
    pub fn route_key(&self, key: u32) -> &Url {
        self.tree.match_sharding_key(key)
    }

    /// The smallest id owned by the given server, when the path has a
    /// single id component.
    pub fn min_id(&self, url: &Url) -> Option<i64> {
        self.min_ids.get(url).copied()
    }

    /// The server owning the smallest representable id.
    pub fn first_server_url(&self) -> &Url {
        &self.first_server_url
    }

    /// The next server in the fleet-wide enumeration order, or `None` for
    /// the last server (and for URLs not in this config).
    pub fn successor_of(&self, url: &Url) -> Option<&Url> {
        self.successor.get(url).and_then(|next| next.as_ref())
    }

    /// Opaque version token: hex MD5 of the raw config bytes.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of distinct servers in the fleet.
    pub fn server_count(&self) -> usize {
        self.min_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::shard_key;

    fn config(raw: &str) -> ServersConfig {
        ServersConfig::from_bytes(raw.as_bytes()).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn single_server_config() {
        let cfg = config("* http://only:8001/\n");
        assert_eq!(cfg.server_count(), 1);
        assert_eq!(cfg.first_server_url(), &url("http://only:8001/"));
        assert_eq!(cfg.min_id(&url("http://only:8001/")), Some(i64::MIN));
        assert_eq!(cfg.successor_of(&url("http://only:8001/")), None);
        assert_eq!(cfg.version(), "fc1f6d45457cfaaa52b309eea9c6e108");
    }

    #[test]
    fn two_server_min_ids_and_order() {
        let cfg = config("0.* http://a:8001/\n1.* http://b:8001/\n");
        let a = url("http://a:8001/");
        let b = url("http://b:8001/");

        // shard_key(i64::MIN) has bit 31 clear, so `a` owns the first id;
        // the first id owned by `b` is i64::MIN + 2.
        assert_eq!(cfg.first_server_url(), &a);
        assert_eq!(cfg.min_id(&a), Some(i64::MIN));
        assert_eq!(cfg.min_id(&b), Some(i64::MIN + 2));
        assert_eq!(cfg.successor_of(&a), Some(&b));
        assert_eq!(cfg.successor_of(&b), None);
    }

    #[test]
    fn min_ids_are_minimal_and_owned() {
        let cfg = config(
            "0.0.* http://s1:8001/\n\
             0.1.* http://s2:8001/\n\
             1.0.* http://s3:8001/\n\
             1.1.* http://s4:8001/\n",
        );
        for i in 1..=4 {
            let u = url(&format!("http://s{i}:8001/"));
            let min = cfg.min_id(&u).unwrap();
            assert_eq!(cfg.route_key(shard_key(min, None)), &u);
            for id in i64::MIN..min {
                assert_ne!(cfg.route_key(shard_key(id, None)), &u);
            }
        }
    }

    #[test]
    fn successor_chain_is_a_simple_path_over_all_servers() {
        let cfg = config(
            "0.0.* http://s1:8001/\n\
             0.1.* http://s2:8001/\n\
             1.0.* http://s3:8001/\n\
             1.1.* http://s4:8001/\n",
        );
        let mut seen = Vec::new();
        let mut current = Some(cfg.first_server_url().clone());
        while let Some(u) = current {
            assert!(!seen.contains(&u), "successor chain revisited {u}");
            seen.push(u.clone());
            current = cfg.successor_of(&u).cloned();
        }
        assert_eq!(seen.len(), cfg.server_count());
        // After the first server, the chain is ascending by URL string.
        let rest: Vec<_> = seen[1..].iter().map(|u| u.as_str().to_string()).collect();
        let mut sorted = rest.clone();
        sorted.sort();
        assert_eq!(rest, sorted);
    }

    #[test]
    fn every_key_resolves_to_some_server() {
        let cfg = config("0.* http://a:8001/\n1.0.* http://b:8001/\n1.1.* http://c:8001/\n");
        for key in [0u32, 1, 0x7FFF_FFFF, 0x8000_0000, 0xBFFF_FFFF, 0xC000_0000, u32::MAX] {
            let _ = cfg.route_key(key);
        }
    }

    #[test]
    fn blank_and_malformed_lines_are_skipped() {
        let cfg = config(
            "\n  \n0.* http://a:8001/\nthis is not a route\n1.* http://b:8001/\n\n",
        );
        assert_eq!(cfg.server_count(), 2);
    }

    #[test]
    fn incomplete_coverage_is_rejected() {
        assert!(matches!(
            ServersConfig::from_bytes(b"0.* http://a:8001/\n").unwrap_err(),
            ConfigError::Tree(TreeBuildError::MissingRoute(_))
        ));
    }

    #[test]
    fn same_server_may_own_several_subtrees() {
        let cfg = config("0.* http://a:8001/\n1.0.* http://b:8001/\n1.1.* http://a:8001/\n");
        assert_eq!(cfg.server_count(), 2);
        let a = url("http://a:8001/");
        assert_eq!(cfg.min_id(&a), Some(i64::MIN));
    }

    #[test]
    fn version_tracks_raw_bytes() {
        let one = config("* http://only:8001/\n");
        let two = config("* http://only:8001/\n\n");
        assert_ne!(one.version(), two.version());
    }
}

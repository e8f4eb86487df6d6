//! Binary routing tree over the 32-bit sharding-key space.
//!
//! Each leaf owns a contiguous slice of the key space and carries the URL of
//! the server responsible for it. A validated tree is *tight*: every
//! internal node has exactly two children and no URL, every leaf has a URL
//! and no children, so the leaves partition the whole key space.

use crate::routes::{ServerRoute, dotted};
use thiserror::Error;
use url::Url;

#[derive(Debug, Default)]
struct Node {
    url: Option<Url>,
    zero: Option<Box<Node>>,
    one: Option<Box<Node>>,
}

/// Routing tree mapping sharding keys to server URLs.
#[derive(Debug)]
pub struct ServersTree {
    root: Node,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeBuildError {
    #[error("no routes configured")]
    NoRoutes,

    #[error("duplicated route: {0}")]
    DuplicatedRoute(String),

    #[error("missing route: {0}")]
    MissingRoute(String),
}

impl ServersTree {
    /// Builds and validates a tree from parsed routes.
    pub fn build(routes: &[ServerRoute]) -> Result<Self, TreeBuildError> {
        if routes.is_empty() {
            return Err(TreeBuildError::NoRoutes);
        }
        let mut root = Node::default();
        for route in routes {
            insert(&mut root, route)?;
        }
        let mut prefix = String::new();
        validate(&root, &mut prefix)?;
        Ok(Self { root })
    }

    /// Returns the URL of the server owning the given sharding key.
    ///
    /// Descends from bit 31 towards bit 0; a validated tree always reaches a
    /// leaf within the route-grammar depth.
    pub fn match_sharding_key(&self, key: u32) -> &Url {
        let mut node = &self.root;
        for i in (0..32).rev() {
            if let Some(url) = &node.url {
                return url;
            }
            let child = if (key >> i) & 1 == 0 { &node.zero } else { &node.one };
            match child {
                Some(next) => node = next,
                None => unreachable!("validated servers tree does not cover key {key:#010x}"),
            }
        }
        match &node.url {
            Some(url) => url,
            None => unreachable!("validated servers tree does not cover key {key:#010x}"),
        }
    }
}

fn insert(root: &mut Node, route: &ServerRoute) -> Result<(), TreeBuildError> {
    let mut node = root;
    for bit in route.prefix.chars() {
        if node.url.is_some() {
            // An ancestor is already a leaf covering this prefix.
            return Err(TreeBuildError::DuplicatedRoute(dotted(&route.prefix)));
        }
        let child = if bit == '0' { &mut node.zero } else { &mut node.one };
        node = child.get_or_insert_with(Box::default);
    }
    if node.url.is_some() || node.zero.is_some() || node.one.is_some() {
        // The target is already a leaf, or already covered by longer routes.
        return Err(TreeBuildError::DuplicatedRoute(dotted(&route.prefix)));
    }
    node.url = Some(route.url.clone());
    Ok(())
}

fn validate(node: &Node, prefix: &mut String) -> Result<(), TreeBuildError> {
    match (&node.url, &node.zero, &node.one) {
        (Some(_), None, None) => Ok(()),
        (None, Some(zero), Some(one)) => {
            prefix.push('0');
            validate(zero, prefix)?;
            prefix.pop();
            prefix.push('1');
            validate(one, prefix)?;
            prefix.pop();
            Ok(())
        }
        (Some(_), _, _) => Err(TreeBuildError::DuplicatedRoute(dotted(prefix))),
        (None, zero, _) => {
            let missing_bit = if zero.is_none() { '0' } else { '1' };
            let mut missing = prefix.clone();
            missing.push(missing_bit);
            Err(TreeBuildError::MissingRoute(dotted(&missing)))
        }
    }
}

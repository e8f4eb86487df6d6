//! Parsing of server-route config lines.
//!
//! Each non-blank config line carries a route specifier and an upstream URL,
//! separated by whitespace:
//!
//! ```text
//! 0.1.*  http://server3:8001/
//! ```
//!
//! The specifier is a dotted bit prefix terminated by `*`; the bits are
//! matched against the high-order bits of the sharding key. `*` alone
//! routes the whole key space to one server.

use thiserror::Error;
use url::Url;

/// Longest accepted bit prefix in a route specifier.
pub const MAX_ROUTE_BITS: usize = 20;

/// A parsed config line: a bit prefix and the upstream owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRoute {
    /// Bit prefix as a string of `0`/`1` characters, possibly empty.
    pub prefix: String,
    pub url: Url,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteParseError {
    #[error("invalid route specifier: {0}")]
    InvalidSpecifier(String),

    #[error("route specifier has more than {MAX_ROUTE_BITS} bits: {0}")]
    TooManyBits(String),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("server URL scheme must be http: {0}")]
    NotHttp(String),

    #[error("malformed config line: {0}")]
    MalformedLine(String),
}

/// Parses a route specifier into its bit prefix.
pub fn parse_route_specifier(spec: &str) -> Result<String, RouteParseError> {
    let Some(body) = spec.strip_suffix('*') else {
        return Err(RouteParseError::InvalidSpecifier(spec.to_string()));
    };
    let mut bits = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '0' && c != '1' {
            return Err(RouteParseError::InvalidSpecifier(spec.to_string()));
        }
        if chars.next() != Some('.') {
            return Err(RouteParseError::InvalidSpecifier(spec.to_string()));
        }
        bits.push(c);
    }
    if bits.len() > MAX_ROUTE_BITS {
        return Err(RouteParseError::TooManyBits(spec.to_string()));
    }
    Ok(bits)
}

/// Renders a bit prefix back to the dotted specifier form, for error
/// messages and logs.
pub fn dotted(prefix: &str) -> String {
    let mut s = String::with_capacity(2 * prefix.len() + 1);
    for bit in prefix.chars() {
        s.push(bit);
        s.push('.');
    }
    s.push('*');
    s
}

/// Parses one non-blank config line into a [`ServerRoute`].
pub fn parse_config_line(line: &str) -> Result<ServerRoute, RouteParseError> {
    let mut tokens = line.split_whitespace();
    let (Some(spec), Some(url), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(RouteParseError::MalformedLine(line.to_string()));
    };
    let prefix = parse_route_specifier(spec)?;
    let url =
        Url::parse(url).map_err(|_| RouteParseError::InvalidUrl(url.to_string()))?;
    if url.scheme() != "http" {
        return Err(RouteParseError::NotHttp(url.to_string()));
    }
    Ok(ServerRoute { prefix, url })
}

use thiserror::Error;

/// Result type alias for apiproxy operations
pub type Result<T, E = ApiProxyError> = std::result::Result<T, E>;

/// Errors that can occur while serving proxy traffic
#[derive(Error, Debug)]
pub enum ApiProxyError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("Failed to build request: {0}")]
    RequestBuildError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

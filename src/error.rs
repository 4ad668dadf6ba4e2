//! Error types for the caching proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while serving a request
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Invalid target URL: {0}")]
    InvalidUrl(String),

    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("Origin returned HTTP {status}")]
    OriginHttpError { status: u16 },

    #[error("Cache write error: {0}")]
    CacheWriteError(String),

    #[error("Client disconnected")]
    ClientDisconnect,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl ProxyError {
    /// Convert error to the HTTP status code sent to the client
    ///
    /// - `InvalidUrl` is the client's fault: 400
    /// - `OriginUnavailable` becomes 502 Bad Gateway
    /// - `OriginHttpError` passes the origin status through
    /// - anything else is a local failure: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::InvalidUrl(_) => 400,
            ProxyError::OriginUnavailable(_) => 502,
            ProxyError::OriginHttpError { status } => *status,
            ProxyError::CacheWriteError(_) => 500,
            ProxyError::ClientDisconnect => 500,
            ProxyError::ConfigError(_) => 500,
            ProxyError::IoError(_) => 500,
        }
    }

    /// Whether this error is allowed to change the response sent to the client.
    ///
    /// Cache failures and client disconnects are absorbed where they happen.
    pub fn affects_response(&self) -> bool {
        match self {
            ProxyError::InvalidUrl(_) => true,
            ProxyError::OriginUnavailable(_) => true,
            ProxyError::OriginHttpError { .. } => true,
            ProxyError::CacheWriteError(_) => false,
            ProxyError::ClientDisconnect => false,
            ProxyError::ConfigError(_) => true,
            ProxyError::IoError(_) => true,
        }
    }

    /// Wrap an I/O error raised while staging or publishing a cache entry
    pub fn cache_write(context: &str, err: std::io::Error) -> Self {
        ProxyError::CacheWriteError(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::InvalidUrl("x".into()).to_http_status(), 400);
        assert_eq!(ProxyError::OriginUnavailable("x".into()).to_http_status(), 502);
        assert_eq!(ProxyError::OriginHttpError { status: 404 }.to_http_status(), 404);
        assert_eq!(ProxyError::CacheWriteError("x".into()).to_http_status(), 500);
    }

    #[test]
    fn test_cache_failures_are_absorbed() {
        assert!(!ProxyError::CacheWriteError("disk full".into()).affects_response());
        assert!(!ProxyError::ClientDisconnect.affects_response());
        assert!(ProxyError::InvalidUrl("x".into()).affects_response());
        assert!(ProxyError::OriginUnavailable("x".into()).affects_response());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::IoError(msg) if msg.contains("denied")));
    }
}

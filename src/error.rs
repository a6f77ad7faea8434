use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Sieve proxy
#[derive(Error, Debug)]
pub enum SieveError {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request header too large")]
    HeaderTooLarge,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Upstream errors
    #[error("Timeout / No response")]
    Timeout,

    #[error("No response")]
    NoResponse,

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Sieve operations
pub type Result<T> = std::result::Result<T, SieveError>;

impl SieveError {
    /// Get the HTTP status code reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            SieveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            SieveError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,

            SieveError::Timeout => StatusCode::REQUEST_TIMEOUT,

            SieveError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,

            SieveError::NoResponse
            | SieveError::UnknownHost(_)
            | SieveError::ConnectionRefused(_)
            | SieveError::ConnectFailed(_)
            | SieveError::TunnelError(_)
            | SieveError::InvalidConfig(_)
            | SieveError::Io(_)
            | SieveError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text placed in the error page sent to the client
    pub fn client_message(&self) -> String {
        match self {
            SieveError::Timeout => "Timeout / No response".to_string(),
            SieveError::NoResponse => "No response".to_string(),
            SieveError::UnknownHost(_) => "Unknown host".to_string(),
            SieveError::ConnectionRefused(_) => "Connection refused".to_string(),
            SieveError::Io(e) => format!("Error from proxy: {}", e),
            SieveError::ConnectFailed(msg) | SieveError::Http(msg) => {
                format!("Error from proxy: {}", msg)
            }
            other => other.to_string(),
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for SieveError {
    fn from(err: hyper::Error) -> Self {
        if err.is_incomplete_message() {
            return SieveError::NoResponse;
        }
        if err.is_timeout() {
            return SieveError::Timeout;
        }
        SieveError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            SieveError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(SieveError::Timeout.status_code(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            SieveError::NoResponse.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SieveError::UnknownHost("nowhere.invalid".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SieveError::NotImplemented("https".to_string()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_error_client_messages() {
        assert_eq!(SieveError::Timeout.client_message(), "Timeout / No response");
        assert_eq!(SieveError::NoResponse.client_message(), "No response");
        assert_eq!(
            SieveError::UnknownHost("a.invalid".into()).client_message(),
            "Unknown host"
        );
        assert_eq!(
            SieveError::ConnectionRefused("127.0.0.1:1".into()).client_message(),
            "Connection refused"
        );

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        assert_eq!(
            SieveError::Io(io).client_message(),
            "Error from proxy: pipe closed"
        );
    }

    #[test]
    fn test_oversized_head_status() {
        assert_eq!(
            SieveError::HeaderTooLarge.status_code(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
    }
}

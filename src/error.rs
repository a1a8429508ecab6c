//! Error types for the deployment core and JSON error responses for the ingress

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Result alias used throughout the deployment core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by registries, backends and the swap protocol
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lookup on an absent key
    #[error("{0} not found")]
    NotFound(String),

    /// Create over a key that is already present
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// No free port left in the configured range
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    /// Underlying container runtime or CLI failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Bad target URL, bad route name or an image stream that cannot be imported
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Teardown attempted while the resource is still in use
    #[error("{0} is still busy")]
    StillBusy(String),
}

impl Error {
    pub fn backend(context: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        Error::Backend(format!("{}: {}", context, cause))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// HTTP status reported to a registrant when this error aborts a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error codes for ingress dispatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request path has no route segment
    MissingRoute,
    /// No route registered under the requested name
    UnknownRoute,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingRoute => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingRoute => "MISSING_ROUTE",
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

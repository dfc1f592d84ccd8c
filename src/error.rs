//! Error types and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Failure of a single render job.
///
/// `Clone` so one coalesced failure can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// Navigation failed or the page never went network-idle in time
    #[error("navigation of {url} timed out or failed: {reason}")]
    NavigationTimeout { url: String, reason: String },

    /// The page loaded but its markup could not be read back
    #[error("unable to extract markup from {url}: {reason}")]
    Extraction { url: String, reason: String },

    /// The shared browser session is gone; nothing renders until restart
    #[error("browser session unavailable: {0}")]
    SessionUnavailable(String),

    /// The render task ended without reporting a result
    #[error("render job for {0} was abandoned")]
    Abandoned(String),
}

impl RenderError {
    pub fn navigation(url: &str, reason: impl ToString) -> Self {
        RenderError::NavigationTimeout {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Error codes for responses produced by the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    /// No Host header and no authority in the request URI
    MissingHost,
    /// The render pipeline failed for a document request
    RenderFailed,
    /// Failed to reach the mapped upstream (or the no-route sink)
    UpstreamFailed,
    /// The upstream did not answer in time
    UpstreamTimeout,
}

impl GateErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::MissingHost => StatusCode::BAD_REQUEST,
            GateErrorCode::RenderFailed => StatusCode::NOT_FOUND,
            GateErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            GateErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Rendergate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::MissingHost => "MISSING_HOST",
            GateErrorCode::RenderFailed => "RENDER_FAILED",
            GateErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            GateErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// Create a plain-text error response with an X-Rendergate-Error header
pub fn error_response(
    code: GateErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Rendergate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(message.into())).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(GateErrorCode::MissingHost.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GateErrorCode::RenderFailed.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GateErrorCode::UpstreamFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GateErrorCode::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_error_response_is_plain_text() {
        let response = error_response(GateErrorCode::RenderFailed, "error with rendering");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Rendergate-Error").unwrap(),
            "RENDER_FAILED"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"error with rendering");
    }

    #[test]
    fn test_render_error_display() {
        let err = RenderError::navigation("http://origin/a", "timeout after 5000ms");
        assert_eq!(
            err.to_string(),
            "navigation of http://origin/a timed out or failed: timeout after 5000ms"
        );
    }
}

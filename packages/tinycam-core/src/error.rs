//! Centralized error types for the tinycam core library.
//!
//! Variants map 1:1 to the error kinds in the design's error-handling
//! section: `AuthFailure` and `HandshakeFailure` never reach the peer beyond
//! a close code or a 401, `ProtocolFailure` causes the frame to be dropped,
//! `Encoder`/`Resource` failures are process-lifecycle concerns.
//! `BackpressureDrop` and `ShutdownCancellation` are deliberately not
//! variants here - they are not errors for the session.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the tinycam server.
#[derive(Debug, Error)]
pub enum TinycamError {
    /// Missing/invalid token, expired `exp`, malformed `cnonce`.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// No start frame within timeout, unexpected `type`, conn/exp mismatch.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// Malformed binary frame, bad conn-id prefix, non-increasing counter,
    /// decryption tag mismatch.
    #[error("protocol violation: {0}")]
    ProtocolFailure(String),

    /// Child spawn failure or early exit.
    #[error("encoder failure: {0}")]
    EncoderFailure(String),

    /// Device lock already held by another instance.
    #[error("resource unavailable: {0}")]
    ResourceFailure(String),

    /// Malformed configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else that doesn't fit a more specific kind.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode for TinycamError {
    fn code(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "auth_failure",
            Self::HandshakeFailure(_) => "handshake_failure",
            Self::ProtocolFailure(_) => "protocol_failure",
            Self::EncoderFailure(_) => "encoder_failure",
            Self::ResourceFailure(_) => "resource_failure",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl TinycamError {
    /// Maps the error to an appropriate HTTP status code.
    ///
    /// Only reachable from the pre-upgrade path (`AuthFailure` -> 401);
    /// other variants never cross the wire as an HTTP response in the core
    /// streaming path, but keep a sane mapping for completeness.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            Self::HandshakeFailure(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) | Self::ResourceFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for TinycamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Auth/handshake failures are reported to the peer as a generic
        // status only, never which specific check failed. The detailed
        // reason goes to the server log instead.
        let message = match &self {
            Self::AuthFailure(reason) => {
                log::debug!("rejecting /stream upgrade: {reason}");
                "authentication failed".to_string()
            }
            Self::HandshakeFailure(reason) => {
                log::debug!("rejecting handshake: {reason}");
                "handshake failed".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: self.code(),
            message,
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Convenient Result alias for application-wide operations.
pub type TinycamResult<T> = Result<T, TinycamError>;

//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Per-request failures the balancer answers itself.
///
/// Any HTTP response from a backend, including 4xx/5xx, is relayed and never
/// becomes one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// The published healthy set was empty when the request arrived.
    #[error("No healthy backends available")]
    NoBackendsAvailable,

    /// Every healthy backend failed at the transport level.
    #[error("Service Unavailable: All backends are unreachable")]
    AllBackendsUnreachable,

    #[error("invalid request body: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoBackendsAvailable | Error::AllBackendsUnreachable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhaustion_bodies_are_exact() {
        for (err, body) in [
            (Error::NoBackendsAvailable, "No healthy backends available"),
            (
                Error::AllBackendsUnreachable,
                "Service Unavailable: All backends are unreachable",
            ),
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            let bytes = axum::body::to_bytes(response.into_body(), 1024)
                .await
                .unwrap();
            assert_eq!(bytes, body.as_bytes());
        }
    }

    #[test]
    fn invalid_request_is_client_error() {
        let err = Error::InvalidRequest("length limit exceeded".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("length limit exceeded"));
    }
}

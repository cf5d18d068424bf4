use thiserror::Error;

use crate::event_engine::{FailureKind, SourceError};

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("unexpected HTTP status while calling {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },
    #[error("token request rejected: {0}")]
    Auth(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

impl MarketplaceError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnexpectedStatus { status, .. } => failure_kind_for_status(*status),
            Self::Auth(_) => FailureKind::Unauthorized,
            Self::Config(_) => FailureKind::Other,
            Self::JsonParseError(_) => FailureKind::MalformedResponse,
            Self::RequestError(req_err) => {
                if let Some(status) = req_err.status() {
                    failure_kind_for_status(status.as_u16())
                } else if req_err.is_timeout() {
                    FailureKind::Timeout
                } else if req_err.is_connect() || req_err.is_request() || req_err.is_body() {
                    FailureKind::Network
                } else if req_err.is_decode() {
                    FailureKind::MalformedResponse
                } else {
                    FailureKind::Other
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.failure_kind(),
            FailureKind::Network
                | FailureKind::RateLimited
                | FailureKind::UpstreamUnavailable
                | FailureKind::Timeout
        )
    }
}

fn failure_kind_for_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Unauthorized,
        404 => FailureKind::NotFound,
        429 => FailureKind::RateLimited,
        500..=599 => FailureKind::UpstreamUnavailable,
        _ => FailureKind::Other,
    }
}

impl From<MarketplaceError> for SourceError {
    fn from(err: MarketplaceError) -> Self {
        SourceError::new(err.failure_kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::MarketplaceError;
    use crate::event_engine::{FailureKind, SourceError};

    fn status(status: u16) -> MarketplaceError {
        MarketplaceError::UnexpectedStatus {
            resource: "events".to_string(),
            status,
        }
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert_eq!(status(503).failure_kind(), FailureKind::UpstreamUnavailable);
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400, 401, 404, 422] {
            assert!(!status(code).is_retryable(), "status {code} should not retry");
        }
        assert_eq!(status(404).failure_kind(), FailureKind::NotFound);
    }

    #[test]
    fn decode_errors_map_to_malformed_source_errors() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{")
            .expect_err("fixture should produce a json parse failure");
        let mapped = SourceError::from(MarketplaceError::from(parse_err));
        assert_eq!(mapped.kind, FailureKind::MalformedResponse);
        assert!(!mapped.is_retryable());
    }
}

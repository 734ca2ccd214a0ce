use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenError>;

#[derive(Debug, Error)]
pub enum GenError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl GenError {
    /// Network failures, 429 and any 5xx are worth another attempt. Every other
    /// status is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::InvalidInput(_) | Self::ResponseFormat(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GenError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for GenError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::GenError;

    #[test]
    fn retry_predicate_covers_transport_429_and_5xx_only() {
        assert!(GenError::Transport("reset".to_string()).is_retryable());
        for status in [429, 500, 502, 503, 599] {
            let err = GenError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            let err = GenError::Status {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "status {status} should not retry");
        }
        assert!(!GenError::ResponseFormat("bad json".to_string()).is_retryable());
    }
}

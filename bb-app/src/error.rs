use bb_gen::GenError;
use bb_media::MediaError;
use std::time::Duration;

/// How a failed job is reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Api,
    Processing,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("generation api: {0}")]
    Api(#[from] GenError),
    #[error("processing: {0}")]
    Processing(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
}

impl JobError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Api(_) => ErrorCategory::Api,
            Self::Processing(_) | Self::TimedOut(_) => ErrorCategory::Processing,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Text shown to the user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("❌ {msg}"),
            Self::Api(GenError::Status { status: 429, .. }) => {
                "❌ The image service is busy right now. Please try again in a minute.".to_string()
            }
            Self::Api(e) if e.is_retryable() => {
                "❌ The image service is unavailable right now. Please try again later.".to_string()
            }
            Self::Api(GenError::Status { status, .. }) => {
                format!("❌ The image service rejected the request (HTTP {status}).")
            }
            Self::Api(_) => "❌ The image service returned an unexpected response.".to_string(),
            Self::Processing(msg) => format!("❌ Processing failed: {msg}"),
            Self::TimedOut(limit) => {
                format!("❌ The job took longer than {}s and was stopped.", limit.as_secs())
            }
            Self::Internal(_) => "❌ Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<MediaError> for JobError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Validation(msg) => Self::Validation(msg),
            other => Self::Processing(other.to_string()),
        }
    }
}

/// A command rejected before admission; never enters the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_distinct_messages() {
        let busy = JobError::from(GenError::Status {
            status: 429,
            body: String::new(),
        });
        let fatal = JobError::from(GenError::Status {
            status: 403,
            body: "forbidden".to_string(),
        });
        assert_eq!(busy.category(), ErrorCategory::Api);
        assert!(busy.user_message().contains("busy"));
        assert!(fatal.user_message().contains("HTTP 403"));
        assert!(!fatal.user_message().contains("forbidden"));
    }

    #[test]
    fn media_validation_stays_a_validation_error() {
        let err = JobError::from(MediaError::Validation("too big".to_string()));
        assert_eq!(err.category(), ErrorCategory::Validation);
        let err = JobError::from(MediaError::Decode("bad bytes".to_string()));
        assert_eq!(err.category(), ErrorCategory::Processing);
    }

    #[test]
    fn validation_error_displays_its_message_as_an_error() {
        let err: Box<dyn std::error::Error> = Box::new(ValidationError::new("Prompt cannot be empty"));
        assert_eq!(err.to_string(), "Prompt cannot be empty");
        assert!(err.source().is_none());
    }

    #[test]
    fn internal_details_are_not_shown() {
        let err = JobError::Internal("handler panicked: index out of bounds".to_string());
        assert!(!err.user_message().contains("index"));
    }
}

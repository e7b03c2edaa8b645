use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

const MAX_BODY_IN_MESSAGE: usize = 512;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("stored data is unreadable: {0}")]
    Storage(String),
    #[error("missing provider credentials: {0} is not set")]
    MissingCredentials(&'static str),
    #[error("provider request failed with status code {status}: {}", truncate_body(.body))]
    Provider { status: u16, body: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("{failed} of {total} queries failed: {}", .causes.join("; "))]
    Aggregate {
        failed: usize,
        total: usize,
        causes: Vec<String>,
    },
    #[error("ingestion produced no records to store")]
    EmptyIngestion,
    #[error("worker task failed: {0}")]
    Join(String),
}

impl AppError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(err) => {
                if err.is_decode() || err.is_builder() {
                    return false;
                }
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            AppError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_BODY_IN_MESSAGE {
        return body;
    }
    let mut end = MAX_BODY_IN_MESSAGE;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_statuses() {
        let server_error = AppError::Provider {
            status: 503,
            body: String::new(),
        };
        let throttled = AppError::Provider {
            status: 429,
            body: "Too many requests".into(),
        };
        let bad_request = AppError::Provider {
            status: 400,
            body: "invalid query".into(),
        };
        assert!(server_error.is_transient());
        assert!(throttled.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!AppError::Cancelled.is_transient());
        assert!(!AppError::EmptyIngestion.is_transient());
    }

    #[test]
    fn provider_error_keeps_status_and_body() {
        let err = AppError::Provider {
            status: 500,
            body: "upstream exploded".into(),
        };
        let message = err.to_string();
        assert!(message.contains("500"));
        assert!(message.contains("upstream exploded"));
    }

    #[test]
    fn long_bodies_are_truncated_in_messages() {
        let err = AppError::Provider {
            status: 502,
            body: "é".repeat(600),
        };
        assert!(err.to_string().len() < 600 * 2);
    }

    #[test]
    fn aggregate_lists_every_cause() {
        let err = AppError::Aggregate {
            failed: 2,
            total: 5,
            causes: vec!["query 'A': boom".into(), "query 'B': bust".into()],
        };
        let message = err.to_string();
        assert!(message.starts_with("2 of 5 queries failed"));
        assert!(message.contains("boom"));
        assert!(message.contains("bust"));
    }
}

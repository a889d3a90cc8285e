use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend api error: status={status} code={code:?} message={message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("backend network error: {0}")]
    Network(String),

    #[error("unexpected backend response: {0}")]
    ResponseFormat(String),
}

impl BackendError {
    /// Errors worth retrying: network failures, rate limits, 5xx, and the
    /// "run is still active on this thread" race, which resolves itself
    /// once the previous run settles.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::ResponseFormat(_) => false,
            Self::Api {
                status,
                code,
                message,
            } => {
                if *status == 429 || *status >= 500 {
                    return true;
                }
                if code.as_deref() == Some("rate_limit_exceeded") {
                    return true;
                }
                *status == 400 && message.contains("while a run is active")
            }
        }
    }

    /// The local thread mapping points at a thread the backend no longer
    /// recognizes. Structured detection first (404 on a thread-scoped
    /// route); the substring match is a fallback for gateways that report
    /// the condition as a 400 with prose.
    pub fn is_invalid_thread(&self) -> bool {
        match self {
            Self::Api {
                status, message, ..
            } => {
                if *status == 404 {
                    return true;
                }
                let lower = message.to_ascii_lowercase();
                lower.contains("thread") && lower.contains("not found")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        let rate_limited = BackendError::Api {
            status: 429,
            code: Some("rate_limit_exceeded".to_string()),
            message: "slow down".to_string(),
        };
        assert!(rate_limited.is_transient());

        let server = BackendError::Api {
            status: 503,
            code: None,
            message: "overloaded".to_string(),
        };
        assert!(server.is_transient());

        let bad_request = BackendError::Api {
            status: 400,
            code: Some("invalid_request_error".to_string()),
            message: "missing field".to_string(),
        };
        assert!(!bad_request.is_transient());
    }

    #[test]
    fn thread_busy_race_is_transient() {
        let busy = BackendError::Api {
            status: 400,
            code: None,
            message: "Can't add messages to thread while a run is active".to_string(),
        };
        assert!(busy.is_transient());
    }

    #[test]
    fn invalid_thread_detected_by_status_then_message() {
        let not_found = BackendError::Api {
            status: 404,
            code: None,
            message: "No thread found with id thread_abc".to_string(),
        };
        assert!(not_found.is_invalid_thread());

        let prose = BackendError::Api {
            status: 400,
            code: None,
            message: "Thread not found".to_string(),
        };
        assert!(prose.is_invalid_thread());

        let unrelated = BackendError::Network("connection reset".to_string());
        assert!(!unrelated.is_invalid_thread());
    }
}

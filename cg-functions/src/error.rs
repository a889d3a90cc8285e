use thiserror::Error;

pub type Result<T> = std::result::Result<T, FunctionError>;

#[derive(Debug, Error)]
pub enum FunctionError {
    /// The backend asked for a capability this deployment does not have.
    /// Distinct so the orchestrator can treat it as a terminal failure.
    #[error("unknown function: {0}")]
    Unknown(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<reqwest::Error> for FunctionError {
    fn from(e: reqwest::Error) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

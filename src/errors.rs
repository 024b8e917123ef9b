use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("STORE_FAILURE: {0}")]
    Store(String),
    #[error("FILESYSTEM_FAILURE: {0}")]
    Filesystem(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("TOOL_EXECUTION: {0}")]
    ToolExecution(String),
    /// A multi-step write applied only part of its effect and could not be
    /// undone. The message names both halves so an operator can reconcile.
    #[error("PARTIAL_FAILURE: {0}")]
    PartialFailure(String),
    #[error("INVALID_INPUT: {0}")]
    Invalid(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "STORE_FAILURE",
            Self::Filesystem(_) => "FILESYSTEM_FAILURE",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ToolExecution(_) => "TOOL_EXECUTION",
            Self::PartialFailure(_) => "PARTIAL_FAILURE",
            Self::Invalid(_) => "INVALID_INPUT",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Filesystem(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

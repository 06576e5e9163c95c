use crate::period::Period;

pub type Result<T> = std::result::Result<T, ResultsError>;

#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    /// Malformed period key or field value.
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("period {period} is locked")]
    Locked { period: Period },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("settings error: {0:#}")]
    Settings(#[from] anyhow::Error),
}

impl ResultsError {
    pub fn validation(message: impl Into<String>) -> Self {
        ResultsError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        ResultsError::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Wire code reported to IPC callers.
    pub fn code(&self) -> &'static str {
        match self {
            ResultsError::Validation { .. } => "bad_params",
            ResultsError::Locked { .. } => "period_locked",
            ResultsError::Store(_) | ResultsError::Settings(_) => "db_failed",
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, ResultsError::Locked { .. })
    }
}


use conductor_core::work_item::WorkItemId;

/// Process exit codes reported by the CLI
pub const EXIT_OK: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] conductor_storage::Error),

    #[error("{0}")]
    Core(#[from] conductor_core::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workspace error for {work_item_id}: {message}")]
    Workspace {
        work_item_id: WorkItemId,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn workspace<S: Into<String>>(work_item_id: &WorkItemId, message: S) -> Self {
        Self::Workspace {
            work_item_id: work_item_id.clone(),
            message: message.into(),
        }
    }

    /// The store cannot be reached; the current pass must stop
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            AppError::Storage(e) => e.is_unavailable(),
            AppError::Core(conductor_core::Error::StoreUnavailable(_)) => true,
            _ => false,
        }
    }

    pub fn is_claim_denied(&self) -> bool {
        match self {
            AppError::Storage(e) => e.is_claim_denied(),
            AppError::Core(e) => e.is_claim_denied(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_store_unavailable() {
            EXIT_FATAL
        } else {
            match self {
                AppError::Config(_) | AppError::Storage(_) => EXIT_FATAL,
                _ => EXIT_PARTIAL,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

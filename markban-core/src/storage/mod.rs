pub mod local;
pub mod lock;
pub mod order;
pub mod project;

use crate::parser::ParseError;

/// Coarse classification callers map onto their response classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Task index {index} not found on card {card} ({count} tasks)")]
    TaskNotFound {
        card: String,
        index: usize,
        count: usize,
    },

    #[error("Card not found in lane {lane}: {filename}")]
    CardNotInLane { lane: String, filename: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Project already exists: {0}")]
    ProjectExists(String),

    #[error("Prefix already in use: {0}")]
    PrefixTaken(String),

    #[error("Invalid card file {path}: {source}")]
    InvalidFrontmatter {
        path: String,
        #[source]
        source: ParseError,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::ProjectNotFound(_)
            | StorageError::CardNotFound(_)
            | StorageError::TaskNotFound { .. } => ErrorKind::NotFound,
            StorageError::CardNotInLane { .. }
            | StorageError::Validation(_)
            | StorageError::ProjectExists(_)
            | StorageError::PrefixTaken(_) => ErrorKind::BadRequest,
            StorageError::InvalidFrontmatter { .. }
            | StorageError::Json { .. }
            | StorageError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub(crate) fn validation(message: impl Into<String>) -> StorageError {
    StorageError::Validation(message.into())
}

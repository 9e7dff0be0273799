use serde_json::{json, Value};
use thiserror::Error;

/// Failure taxonomy shared by every handler. Each variant maps onto one wire
/// error code; the request is aborted and any open transaction rolled back.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{what} not found")]
    NotFound {
        what: &'static str,
        details: Option<Value>,
    },

    #[error("{message}")]
    Integrity {
        message: String,
        details: Option<Value>,
    },

    #[error("{0}")]
    BadParams(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn not_found(what: &'static str) -> Self {
        Self::NotFound {
            what,
            details: None,
        }
    }

    pub fn not_found_id(what: &'static str, id: &str) -> Self {
        Self::NotFound {
            what,
            details: Some(json!({ "id": id })),
        }
    }

    pub fn integrity(message: impl Into<String>, details: Value) -> Self {
        Self::Integrity {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Integrity { .. } => "integrity_violation",
            Self::BadParams(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Db(_) | Self::Other(_) => "db_error",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::NotFound { details, .. } | Self::Integrity { details, .. } => details.clone(),
            _ => None,
        }
    }
}

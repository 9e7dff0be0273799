use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// `{"id", "method", "params"}`; `params.actor` carries the caller.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Per-process state: the open workspace and its SQLite connection.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

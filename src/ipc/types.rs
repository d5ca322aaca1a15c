use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line on stdin: `{ "id": ..., "method": ..., "params": ... }`.
/// Params default to `null` so parameterless methods can omit them.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Process-wide mutable state. Everything except `health` and
/// `workspace.select` requires an open workspace database.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

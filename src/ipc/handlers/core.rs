use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};
use tracing::info;

use super::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;

fn handle_health(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "maxUploadBytes": state.config.max_upload_bytes,
        "reconcileWorkers": state.config.reconcile_workers,
    }))
}

/// Opens (creating if needed) the SQLite workspace and makes it current.
/// The previous store is dropped only after the new one opened cleanly.
pub fn select_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("failed to open workspace {}", path.to_string_lossy()))?;
    state.workspace = Some(path.to_path_buf());
    state.store = Some(store);
    info!(workspace = %path.to_string_lossy(), "workspace selected");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Err(HandlerErr::bad_params("missing params.path"));
    };

    select_workspace(state, &path).map_err(|e| HandlerErr {
        code: "db_open_failed",
        status: 500,
        message: format!("{e:#}"),
        details: None,
    })?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{get_opt_str, get_required_str, principal, respond, HandlerErr};
use crate::error::CoreError;
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, RosterEntry};
use crate::roster::{self, RosterFormat};

pub(crate) const UPLOADS_DIR: &str = "uploads";

pub(crate) struct LoadedRoster {
    pub file_name: String,
    pub sha256: String,
    pub entries: Vec<RosterEntry>,
}

fn io_failure(code: &'static str, path: &Path, e: std::io::Error) -> HandlerErr {
    HandlerErr {
        code,
        status: 500,
        message: format!("{}: {}", path.to_string_lossy(), e),
        details: None,
    }
}

/// Reads the roster named by `rosterPath`, or stages `fileName` +
/// `contentBase64` into `<workspace>/uploads` and reads it from there. The
/// staged file is removed when this returns, whatever the outcome.
pub(crate) fn load_roster(state: &AppState, params: &Value) -> Result<LoadedRoster, HandlerErr> {
    let limit = state.config.max_upload_bytes;

    if let Some(raw_path) = get_opt_str(params, "rosterPath") {
        let path = PathBuf::from(raw_path);
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let format = RosterFormat::from_file_name(&file_name)?;
        let meta = fs::metadata(&path).map_err(|e| HandlerErr {
            code: "not_found",
            status: 404,
            message: format!("cannot read roster {}: {}", path.to_string_lossy(), e),
            details: None,
        })?;
        if meta.len() > limit as u64 {
            return Err(CoreError::RosterTooLarge {
                size: usize::try_from(meta.len()).unwrap_or(usize::MAX),
                limit,
            }
            .into());
        }
        let bytes = fs::read(&path).map_err(|e| io_failure("roster_read_failed", &path, e))?;
        return parse_bytes(file_name, &bytes, format);
    }

    let file_name = get_required_str(params, "fileName")
        .map_err(|_| HandlerErr::bad_params("missing rosterPath or fileName + contentBase64"))?;
    let format = RosterFormat::from_file_name(&file_name)?;
    let encoded = get_required_str(params, "contentBase64")?;
    // Decoded length is at most 3/4 of the encoded length.
    let estimate = encoded.len() / 4 * 3;
    if estimate > limit.saturating_add(3) {
        return Err(CoreError::RosterTooLarge {
            size: estimate,
            limit,
        }
        .into());
    }
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| HandlerErr::bad_params(format!("contentBase64 is not valid base64: {}", e)))?;
    if bytes.len() > limit {
        return Err(CoreError::RosterTooLarge {
            size: bytes.len(),
            limit,
        }
        .into());
    }

    let staged = stage_upload(state, &bytes, format)?;
    let staged_bytes =
        fs::read(staged.path()).map_err(|e| io_failure("roster_read_failed", staged.path(), e))?;
    let loaded = parse_bytes(file_name, &staged_bytes, format);
    debug!(path = %staged.path().to_string_lossy(), "removing staged roster");
    loaded
}

fn stage_upload(
    state: &AppState,
    bytes: &[u8],
    format: RosterFormat,
) -> Result<NamedTempFile, HandlerErr> {
    let workspace = state.workspace.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        status: 503,
        message: "select a workspace first".to_string(),
        details: None,
    })?;
    let dir = workspace.join(UPLOADS_DIR);
    fs::create_dir_all(&dir).map_err(|e| io_failure("upload_stage_failed", &dir, e))?;
    let mut file = tempfile::Builder::new()
        .prefix("roster-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile_in(&dir)
        .map_err(|e| io_failure("upload_stage_failed", &dir, e))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|e| io_failure("upload_stage_failed", &dir, e))?;
    Ok(file)
}

fn parse_bytes(
    file_name: String,
    bytes: &[u8],
    format: RosterFormat,
) -> Result<LoadedRoster, HandlerErr> {
    let entries = roster::parse(bytes, format)?;
    Ok(LoadedRoster {
        file_name,
        sha256: roster::digest(bytes),
        entries,
    })
}

fn roster_parse(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    principal(params)?.require(Role::Club)?;
    let loaded = load_roster(state, params)?;
    Ok(json!({
        "fileName": loaded.file_name,
        "rosterSha256": loaded.sha256,
        "count": loaded.entries.len(),
        "rows": loaded
            .entries
            .iter()
            .map(|e| json!({ "row": e.row, "identifier": e.identifier }))
            .collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "roster.parse" => roster_parse(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{parse_date, parse_instant, Principal, Role};
use crate::store::SqliteStore;

pub mod attendance;
pub mod core;
pub mod directory;
pub mod reconcile;
pub mod reports;
pub mod roster;
pub mod windows;

#[derive(Debug)]
pub(crate) struct HandlerErr {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            status: 400,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.status, self.message, self.details)
    }
}

impl From<CoreError> for HandlerErr {
    fn from(e: CoreError) -> Self {
        let details = match &e {
            CoreError::RosterTooLarge { size, limit } => {
                Some(json!({ "size": size, "limit": limit }))
            }
            _ => None,
        };
        HandlerErr {
            code: e.code(),
            status: e.http_status(),
            message: e.to_string(),
            details,
        }
    }
}

pub(crate) fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub(crate) fn store(state: &AppState) -> Result<&SqliteStore, HandlerErr> {
    state.store.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        status: 503,
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub(crate) fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_opt_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub(crate) fn get_required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    Ok(parse_date(&get_required_str(params, key)?)?)
}

pub(crate) fn get_required_instant(
    params: &Value,
    key: &str,
) -> Result<DateTime<Utc>, HandlerErr> {
    Ok(parse_instant(&get_required_str(params, key)?)?)
}

pub(crate) fn get_opt_instant(
    params: &Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match get_opt_str(params, key) {
        Some(s) => Ok(Some(parse_instant(&s)?)),
        None => Ok(None),
    }
}

pub(crate) fn get_required_u32(params: &Value, key: &str) -> Result<u32, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key)))
}

/// `params.principal = {id, role}` as resolved by the identity layer.
pub(crate) fn principal(params: &Value) -> Result<Principal, HandlerErr> {
    let p = params
        .get("principal")
        .ok_or_else(|| HandlerErr::bad_params("missing principal"))?;
    let id = get_required_str(p, "id")
        .map_err(|_| HandlerErr::bad_params("missing principal.id"))?;
    let role_raw = get_required_str(p, "role")
        .map_err(|_| HandlerErr::bad_params("missing principal.role"))?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown principal role: {}", role_raw)))?;
    Ok(Principal { id, role })
}

use serde_json::{json, Value};

use super::{
    get_opt_instant, get_opt_str, get_required_instant, get_required_str, principal, respond,
    store, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::windows::{self, NewWindow};

fn windows_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let club_id = get_required_str(params, "clubId")?;
    let event_name = get_required_str(params, "eventName")?;
    let start = get_required_instant(params, "start")?;
    let end = get_required_instant(params, "end")?;
    let now = state.clock.now();
    let window = windows::create(
        store(state)?,
        &actor,
        NewWindow {
            club_id: &club_id,
            event_name: &event_name,
            start,
            end,
        },
        now,
    )?;
    Ok(json!({ "window": window.to_json(now) }))
}

fn windows_revoke(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let window_id = get_required_str(params, "windowId")?;
    let window = windows::revoke(store(state)?, &actor, &window_id)?;
    Ok(json!({ "window": window.to_json(state.clock.now()) }))
}

fn windows_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let window_id = get_required_str(params, "windowId")?;
    let window = windows::get(store(state)?, &window_id)?;
    Ok(json!({ "window": window.to_json(state.clock.now()) }))
}

fn windows_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let club_id = get_opt_str(params, "clubId");
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let now = state.clock.now();
    let list = windows::list(store(state)?, &actor, club_id.as_deref(), active_only, now)?;
    Ok(json!({
        "windows": list.iter().map(|w| w.to_json(now)).collect::<Vec<_>>()
    }))
}

fn windows_is_active(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let window_id = get_required_str(params, "windowId")?;
    let at = get_opt_instant(params, "at")?.unwrap_or_else(|| state.clock.now());
    let active = windows::is_active(store(state)?, &window_id, at)?;
    Ok(json!({ "windowId": window_id, "at": at.to_rfc3339(), "active": active }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "windows.create" => windows_create(state, &req.params),
        "windows.revoke" => windows_revoke(state, &req.params),
        "windows.get" => windows_get(state, &req.params),
        "windows.list" => windows_list(state, &req.params),
        "windows.isActive" => windows_is_active(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::roster::load_roster;
use super::{get_opt_str, get_required_str, principal, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::reconcile::{self, ReconcileOptions, ReconcileRequest};

fn reconcile_run(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    actor.require(Role::Club)?;
    let window_id = get_required_str(params, "windowId")?;
    let event_name = get_opt_str(params, "eventName");
    let deadline_ms = match params.get("deadlineMs") {
        None | Some(Value::Null) => state.config.reconcile_deadline_ms,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| HandlerErr::bad_params("deadlineMs must be a non-negative integer"))?,
    };
    let store = store(state)?;
    let loaded = load_roster(state, params)?;

    let options = ReconcileOptions {
        workers: state.config.reconcile_workers,
        deadline: (deadline_ms > 0).then(|| Instant::now() + Duration::from_millis(deadline_ms)),
        ..ReconcileOptions::default()
    };
    let outcome = reconcile::reconcile(
        store,
        state.clock.as_ref(),
        &actor,
        ReconcileRequest {
            window_id: &window_id,
            event_name: event_name.as_deref(),
            roster: &loaded.entries,
            roster_sha256: loaded.sha256.clone(),
        },
        &options,
    )?;
    let mut result = outcome.to_json();
    result["fileName"] = json!(loaded.file_name);
    result["rosterSize"] = json!(loaded.entries.len());
    Ok(result)
}

fn reconcile_history(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let club_id = get_opt_str(params, "clubId");
    let runs = reconcile::history(store(state)?, &actor, club_id.as_deref())?;
    Ok(json!({ "runs": runs.iter().map(|r| r.to_json()).collect::<Vec<_>>() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "reconcile.run" => reconcile_run(state, &req.params),
        "reconcile.history" => reconcile_history(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

use serde_json::{json, Value};

use super::{principal, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::reports;

fn reports_summary(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let summary = reports::summary(store(state)?, &actor, state.clock.now())?;
    Ok(json!({ "summary": summary.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "reports.summary" => reports_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

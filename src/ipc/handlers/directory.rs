use serde_json::{json, Value};
use tracing::info;

use super::{get_opt_str, get_required_str, principal, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::model::{Club, Role, Subject};
use crate::store::{retry_once, Directory};

fn club_json(c: &Club) -> Value {
    json!({ "id": c.id, "name": c.name, "leaderId": c.leader_id })
}

fn subject_json(s: &Subject) -> Value {
    json!({ "code": s.code, "name": s.name, "teacherId": s.teacher_id })
}

fn clubs_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    principal(params)?.require(Role::Vc)?;
    let club = Club {
        id: get_required_str(params, "id")?,
        name: get_required_str(params, "name")?,
        leader_id: get_opt_str(params, "leaderId"),
    };
    let store = store(state)?;
    retry_once("upsert_club", || store.upsert_club(&club))?;
    info!(club_id = %club.id, "club saved");
    Ok(json!({ "club": club_json(&club) }))
}

fn clubs_list(state: &AppState) -> Result<Value, HandlerErr> {
    let store = store(state)?;
    let clubs = retry_once("list_clubs", || store.list_clubs())?;
    Ok(json!({ "clubs": clubs.iter().map(club_json).collect::<Vec<_>>() }))
}

fn subjects_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let subject = Subject {
        code: get_required_str(params, "code")?,
        name: get_required_str(params, "name")?,
        teacher_id: get_required_str(params, "teacherId")?,
    };
    let subject = ledger::register_subject(store(state)?, &actor, subject)?;
    Ok(json!({ "subject": subject_json(&subject) }))
}

fn subjects_list(state: &AppState) -> Result<Value, HandlerErr> {
    let store = store(state)?;
    let subjects = retry_once("list_subjects", || store.list_subjects())?;
    Ok(json!({ "subjects": subjects.iter().map(subject_json).collect::<Vec<_>>() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "clubs.upsert" => clubs_upsert(state, &req.params),
        "clubs.list" => clubs_list(state),
        "subjects.upsert" => subjects_upsert(state, &req.params),
        "subjects.list" => subjects_list(state),
        _ => return None,
    };
    Some(respond(req, result))
}

use serde_json::{json, Value};

use super::{
    get_opt_str, get_required_date, get_required_str, get_required_u32, principal, respond,
    store, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, PeriodMark, ALL_STATUSES};
use crate::model::AttendanceStatus;

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "unknown status {:?} (expected present, absent or not_marked)",
            raw
        ))
    })
}

fn parse_marks(params: &Value) -> Result<Vec<PeriodMark>, HandlerErr> {
    let Some(rows) = params.get("marks").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("marks must be an array"));
    };
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let student_id = get_required_str(row, "studentId")
                .map_err(|_| HandlerErr::bad_params(format!("marks[{}].studentId missing", i)))?;
            let status = get_required_str(row, "status")
                .map_err(|_| HandlerErr::bad_params(format!("marks[{}].status missing", i)))?;
            Ok(PeriodMark {
                student_id,
                status: parse_status(&status)?,
            })
        })
        .collect()
}

fn mark(state: &AppState, params: &Value, marks: Vec<PeriodMark>) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let subject_code = get_required_str(params, "subjectCode")?;
    let date = get_required_date(params, "date")?;
    let period = get_required_u32(params, "period")?;
    let entries = ledger::mark_period(
        store(state)?,
        &actor,
        &subject_code,
        date,
        period,
        &marks,
        state.clock.now(),
    )?;
    Ok(json!({
        "count": entries.len(),
        "entries": entries.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
    }))
}

fn attendance_mark_period(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let marks = parse_marks(params)?;
    mark(state, params, marks)
}

fn attendance_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let marks = vec![PeriodMark {
        student_id: get_required_str(params, "studentId")?,
        status: parse_status(&get_required_str(params, "status")?)?,
    }];
    let mut result = mark(state, params, marks)?;
    let entry = result
        .get_mut("entries")
        .and_then(|v| v.get_mut(0))
        .map(Value::take)
        .unwrap_or(Value::Null);
    Ok(json!({ "entry": entry }))
}

fn attendance_find(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let statuses = match params.get("statusIn").and_then(|v| v.as_array()) {
        Some(list) => list
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| HandlerErr::bad_params("statusIn must contain strings"))
                    .and_then(parse_status)
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => ALL_STATUSES.to_vec(),
    };
    let entries = ledger::find(store(state)?, &student_id, date, &statuses)?;
    Ok(json!({ "entries": entries.iter().map(|e| e.to_json()).collect::<Vec<_>>() }))
}

fn attendance_percent_present(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let percent = ledger::percent_present(store(state)?, &student_id)?;
    Ok(json!({ "studentId": student_id, "percentPresent": percent }))
}

fn attendance_student_day(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let actor = principal(params)?;
    let student_id = get_opt_str(params, "studentId").unwrap_or_else(|| actor.id.clone());
    let date = get_required_date(params, "date")?;
    let entries = ledger::student_day(store(state)?, &actor, &student_id, date)?;
    Ok(json!({
        "studentId": student_id,
        "date": date.format("%Y-%m-%d").to_string(),
        "entries": entries.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.markPeriod" => attendance_mark_period(state, &req.params),
        "attendance.upsert" => attendance_upsert(state, &req.params),
        "attendance.find" => attendance_find(state, &req.params),
        "attendance.percentPresent" => attendance_percent_present(state, &req.params),
        "attendance.studentDay" => attendance_student_day(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

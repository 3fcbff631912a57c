use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use tracing::info;

use crate::error::CoreError;
use crate::model::{
    AttendanceEntry, AttendanceStatus, EntryKey, EntryWrite, Principal, Role, StatusCounts,
    Subject,
};
use crate::store::{retry_once, Directory, Ledger};

pub const ALL_STATUSES: [AttendanceStatus; 3] = [
    AttendanceStatus::Present,
    AttendanceStatus::Absent,
    AttendanceStatus::NotMarked,
];

/// Present share of decided entries, rounded to 2 decimals. NotMarked
/// entries count toward neither side.
pub fn percent_from_counts(counts: &StatusCounts) -> f64 {
    let decided = counts.present + counts.absent;
    if decided == 0 {
        return 0.0;
    }
    let pct = counts.present as f64 * 100.0 / decided as f64;
    (pct * 100.0).round() / 100.0
}

pub fn percent_present<S>(store: &S, student_id: &str) -> Result<f64, CoreError>
where
    S: Ledger + ?Sized,
{
    let counts = retry_once("status_counts", || store.status_counts(Some(student_id)))?;
    Ok(percent_from_counts(&counts))
}

pub fn find<S>(
    store: &S,
    student_id: &str,
    date: NaiveDate,
    status_in: &[AttendanceStatus],
) -> Result<Vec<AttendanceEntry>, CoreError>
where
    S: Ledger + ?Sized,
{
    retry_once("find", || store.find(student_id, date, status_in))
}

/// One student's entries for a date, every status, ordered by period.
/// Students may only look at their own day.
pub fn student_day<S>(
    store: &S,
    actor: &Principal,
    student_id: &str,
    date: NaiveDate,
) -> Result<Vec<AttendanceEntry>, CoreError>
where
    S: Ledger + ?Sized,
{
    if actor.role == Role::Student && actor.id != student_id {
        return Err(CoreError::Forbidden(
            "students may only view their own attendance".to_string(),
        ));
    }
    find(store, student_id, date, &ALL_STATUSES)
}

pub struct PeriodMark {
    pub student_id: String,
    pub status: AttendanceStatus,
}

/// Subjects are fixed once registered: repeating the same registration is a
/// no-op, a different name or teacher for a known code is refused.
pub fn register_subject<S>(store: &S, actor: &Principal, subject: Subject) -> Result<Subject, CoreError>
where
    S: Directory + ?Sized,
{
    actor.require(Role::Vc)?;
    match retry_once("insert_subject", || store.insert_subject(&subject))? {
        None => {
            info!(subject = %subject.code, teacher = %subject.teacher_id, "subject registered");
            Ok(subject)
        }
        Some(existing) if existing == subject => Ok(existing),
        Some(existing) => Err(CoreError::Validation(format!(
            "subject {} is already registered as {:?} taught by {}",
            existing.code, existing.name, existing.teacher_id
        ))),
    }
}

/// Teacher bulk marking of one subject period; every mark goes through
/// upsert and the whole batch commits together.
pub fn mark_period<S>(
    store: &S,
    actor: &Principal,
    subject_code: &str,
    date: NaiveDate,
    period: u32,
    marks: &[PeriodMark],
    now: DateTime<Utc>,
) -> Result<Vec<AttendanceEntry>, CoreError>
where
    S: Directory + Ledger + ?Sized,
{
    actor.require(Role::Teacher)?;
    let subject = retry_once("get_subject", || store.get_subject(subject_code))?
        .ok_or_else(|| CoreError::NotFound(format!("subject not found: {}", subject_code)))?;
    if subject.teacher_id != actor.id {
        return Err(CoreError::Forbidden(format!(
            "subject {} is not taught by {}",
            subject.code, actor.id
        )));
    }

    let mut seen = HashSet::new();
    let mut writes = Vec::with_capacity(marks.len());
    for m in marks {
        let sid = m.student_id.trim();
        if sid.is_empty() {
            return Err(CoreError::Validation(
                "studentId must not be empty".to_string(),
            ));
        }
        if !seen.insert(sid.to_string()) {
            return Err(CoreError::Validation(format!(
                "student {} marked twice in one batch",
                sid
            )));
        }
        writes.push(EntryWrite {
            key: EntryKey {
                student_id: sid.to_string(),
                subject_code: subject.code.clone(),
                date,
                period,
            },
            status: m.status,
            marked_by: actor.id.clone(),
            event_name: None,
        });
    }

    let entries = retry_once("upsert_all", || store.upsert_all(&writes, now))?;
    info!(
        subject = %subject.code,
        date = %date,
        period,
        marks = entries.len(),
        teacher = %actor.id,
        "period marked"
    );
    Ok(entries)
}

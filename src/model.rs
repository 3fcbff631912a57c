use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Club,
    Vc,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "club" => Some(Role::Club),
            "vc" => Some(Role::Vc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Club => "club",
            Role::Vc => "vc",
        }
    }
}

/// Authenticated caller resolved by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn require(&self, role: Role) -> Result<(), CoreError> {
        if self.role == role {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "{} principal cannot perform this action (requires {})",
                self.role.as_str(),
                role.as_str()
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    NotMarked,
}

/// Storage codes for each status. `pending` is only ever read, never written.
const STATUS_CODES: [(AttendanceStatus, &str); 3] = [
    (AttendanceStatus::Present, "P"),
    (AttendanceStatus::Absent, "A"),
    (AttendanceStatus::NotMarked, "N.M."),
];

impl AttendanceStatus {
    pub const UNDECIDED: [AttendanceStatus; 1] = [AttendanceStatus::NotMarked];

    pub fn storage_code(self) -> &'static str {
        STATUS_CODES
            .iter()
            .find(|(s, _)| *s == self)
            .map(|(_, c)| *c)
            .unwrap_or("N.M.")
    }

    /// Every stored code that reads back as this status.
    pub fn storage_codes(self) -> &'static [&'static str] {
        match self {
            AttendanceStatus::Present => &["P"],
            AttendanceStatus::Absent => &["A"],
            AttendanceStatus::NotMarked => &["N.M.", "pending"],
        }
    }

    pub fn from_storage(code: &str) -> Option<AttendanceStatus> {
        if code == "pending" {
            return Some(AttendanceStatus::NotMarked);
        }
        STATUS_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(s, _)| *s)
    }

    /// Accepts wire names and the legacy single-letter codes.
    pub fn parse(s: &str) -> Option<AttendanceStatus> {
        let t = s.trim();
        match t.to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "not_marked" | "notmarked" => Some(AttendanceStatus::NotMarked),
            _ => AttendanceStatus::from_storage(t),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::NotMarked => "not_marked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    Approved,
    Revoked,
}

impl WindowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowStatus::Pending => "pending",
            WindowStatus::Approved => "approved",
            WindowStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<WindowStatus> {
        match s {
            "pending" => Some(WindowStatus::Pending),
            "approved" => Some(WindowStatus::Approved),
            "revoked" => Some(WindowStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalWindow {
    pub id: String,
    pub club_id: String,
    pub event_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: WindowStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ApprovalWindow {
    /// Approved and `start <= at <= end`. Expiry is derived, never stored.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.status == WindowStatus::Approved && self.start <= at && at <= self.end
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.end < at
    }

    pub fn to_json(&self, now: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "clubId": self.club_id,
            "eventName": self.event_name,
            "start": self.start.to_rfc3339(),
            "end": self.end.to_rfc3339(),
            "status": self.status.as_str(),
            "createdBy": self.created_by,
            "createdAt": self.created_at.to_rfc3339(),
            "active": self.is_active_at(now),
            "expired": self.is_expired_at(now),
        })
    }
}

/// Identity of a ledger slot; at most one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub student_id: String,
    pub subject_code: String,
    pub date: NaiveDate,
    pub period: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryWrite {
    pub key: EntryKey,
    pub status: AttendanceStatus,
    pub marked_by: String,
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEntry {
    pub id: String,
    pub key: EntryKey,
    pub status: AttendanceStatus,
    pub marked_by: String,
    pub event_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AttendanceEntry {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "studentId": self.key.student_id,
            "subjectCode": self.key.subject_code,
            "date": self.key.date.format("%Y-%m-%d").to_string(),
            "period": self.key.period,
            "status": self.status.as_str(),
            "markedBy": self.marked_by,
            "eventName": self.event_name,
            "eventMarked": self.event_name.is_some(),
            "updatedAt": self.updated_at.map(|t| t.to_rfc3339()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub present: u64,
    pub absent: u64,
    pub not_marked: u64,
    pub event_marked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Club {
    pub id: String,
    pub name: String,
    pub leader_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub code: String,
    pub name: String,
    pub teacher_id: String,
}

/// One parsed roster identifier plus the sheet row it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub row: usize,
    pub identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NoScheduledPeriod,
    DuplicateIdentifier,
    StoreUnavailable,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub row: usize,
    pub identifier: String,
    pub reason: SkipReason,
}

/// Audit record of one reconciliation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileRun {
    pub id: String,
    pub window_id: String,
    pub club_id: String,
    pub event_name: String,
    pub roster_sha256: String,
    pub roster_size: usize,
    pub marked_count: usize,
    pub skipped_count: usize,
    pub ran_at: DateTime<Utc>,
}

impl ReconcileRun {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "windowId": self.window_id,
            "clubId": self.club_id,
            "eventName": self.event_name,
            "rosterSha256": self.roster_sha256,
            "rosterSize": self.roster_size,
            "markedCount": self.marked_count,
            "skippedCount": self.skipped_count,
            "ranAt": self.ran_at.to_rfc3339(),
        })
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| CoreError::Validation(format!("date must be YYYY-MM-DD, got {:?}", s)))
}

/// RFC 3339 instants; a naive `YYYY-MM-DDTHH:MM[:SS]` is taken as UTC.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, CoreError> {
    let t = s.trim();
    if let Ok(v) = DateTime::parse_from_rfc3339(t) {
        return Ok(v.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(v) = chrono::NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(v.and_utc());
        }
    }
    Err(CoreError::Validation(format!(
        "instant must be RFC 3339, got {:?}",
        s
    )))
}

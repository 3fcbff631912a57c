use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::error::{CoreError, StoreError};
use crate::model::{
    ApprovalWindow, AttendanceEntry, AttendanceStatus, Club, EntryWrite, ReconcileRun,
    StatusCounts, Subject, WindowStatus,
};

#[cfg(test)]
pub mod memory;
pub mod sqlite;

pub use sqlite::SqliteStore;

/// Reference data the core reads: registered clubs and subject ownership.
pub trait Directory: Send + Sync {
    fn upsert_club(&self, club: &Club) -> Result<(), StoreError>;
    fn get_club(&self, id: &str) -> Result<Option<Club>, StoreError>;
    fn list_clubs(&self) -> Result<Vec<Club>, StoreError>;
    /// Registers a new subject. When the code already exists nothing is
    /// written and the stored subject is returned.
    fn insert_subject(&self, subject: &Subject) -> Result<Option<Subject>, StoreError>;
    fn get_subject(&self, code: &str) -> Result<Option<Subject>, StoreError>;
    fn list_subjects(&self) -> Result<Vec<Subject>, StoreError>;
}

pub trait WindowStore: Send + Sync {
    fn insert_window(&self, window: &ApprovalWindow) -> Result<(), StoreError>;
    fn get_window(&self, id: &str) -> Result<Option<ApprovalWindow>, StoreError>;
    /// Returns false when no window has this id.
    fn set_window_status(&self, id: &str, status: WindowStatus) -> Result<bool, StoreError>;
    fn list_windows(&self, club_id: Option<&str>) -> Result<Vec<ApprovalWindow>, StoreError>;
}

/// Attendance entries keyed by (student, subject, date, period).
///
/// `upsert` overwrites status, marker and annotation of an existing key and
/// never duplicates it. Implementations serialize writers so two upserts on
/// one key cannot interleave.
pub trait Ledger: Send + Sync {
    fn upsert(&self, write: &EntryWrite, at: DateTime<Utc>) -> Result<AttendanceEntry, StoreError>;
    /// All-or-nothing batch of upserts.
    fn upsert_all(
        &self,
        writes: &[EntryWrite],
        at: DateTime<Utc>,
    ) -> Result<Vec<AttendanceEntry>, StoreError>;
    fn find(
        &self,
        student_id: &str,
        date: NaiveDate,
        status_in: &[AttendanceStatus],
    ) -> Result<Vec<AttendanceEntry>, StoreError>;
    /// Counts for one student, or campus-wide when `student_id` is None.
    fn status_counts(&self, student_id: Option<&str>) -> Result<StatusCounts, StoreError>;
}

pub trait AuditLog: Send + Sync {
    fn record_run(&self, run: &ReconcileRun) -> Result<(), StoreError>;
    fn list_runs(&self, club_id: Option<&str>) -> Result<Vec<ReconcileRun>, StoreError>;
}

pub trait Store: Directory + WindowStore + Ledger + AuditLog {}

impl<T: Directory + WindowStore + Ledger + AuditLog> Store for T {}

/// Runs a store call, retrying once without backoff on a transient failure.
/// A second transient failure surfaces as `StoreUnavailable`.
pub fn retry_once<T>(
    op_name: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, CoreError> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if e.is_transient() => {
            warn!(op = op_name, error = %e, "transient store failure, retrying once");
            op().map_err(CoreError::from)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_once_recovers_from_single_transient_failure() {
        let calls = Cell::new(0);
        let v = retry_once("probe", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(StoreError::Transient("busy".into()))
            } else {
                Ok(7)
            }
        })
        .expect("second attempt succeeds");
        assert_eq!(v, 7);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_once_gives_up_after_second_transient_failure() {
        let calls = Cell::new(0);
        let e = retry_once::<()>("probe", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Transient("busy".into()))
        })
        .expect_err("should fail");
        assert_eq!(calls.get(), 2);
        assert!(matches!(e, CoreError::StoreUnavailable(_)));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = Cell::new(0);
        let e = retry_once::<()>("probe", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Permanent("constraint".into()))
        })
        .expect_err("should fail");
        assert_eq!(calls.get(), 1);
        assert!(matches!(e, CoreError::Internal(_)));
    }
}

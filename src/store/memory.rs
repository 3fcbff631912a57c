use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use super::{AuditLog, Directory, Ledger, WindowStore};
use crate::error::StoreError;
use crate::reconcile::CancelToken;
use crate::model::{
    ApprovalWindow, AttendanceEntry, AttendanceStatus, Club, EntryKey, EntryWrite, ReconcileRun,
    StatusCounts, Subject, WindowStatus,
};

#[derive(Default)]
struct Inner {
    clubs: BTreeMap<String, Club>,
    subjects: BTreeMap<String, Subject>,
    windows: BTreeMap<String, ApprovalWindow>,
    entries: HashMap<EntryKey, AttendanceEntry>,
    runs: Vec<ReconcileRun>,
    next_id: u64,
}

/// Test double; students listed in `failing_students` make every `find`
/// for them fail transiently. `cancel_on_find` trips its token when the named
/// student is looked up.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pub failing_students: Mutex<HashSet<String>>,
    pub cancel_on_find: Mutex<Option<(String, CancelToken)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Permanent("poisoned".to_string()))
    }

    pub fn entry(&self, key: &EntryKey) -> Option<AttendanceEntry> {
        self.inner.lock().ok()?.entries.get(key).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }
}

fn upsert_in(inner: &mut Inner, write: &EntryWrite, at: DateTime<Utc>) -> AttendanceEntry {
    inner.next_id += 1;
    let fresh_id = format!("e{}", inner.next_id);
    let entry = inner
        .entries
        .entry(write.key.clone())
        .or_insert_with(|| AttendanceEntry {
            id: fresh_id,
            key: write.key.clone(),
            status: write.status,
            marked_by: write.marked_by.clone(),
            event_name: None,
            updated_at: None,
        });
    entry.status = write.status;
    entry.marked_by = write.marked_by.clone();
    entry.event_name = write.event_name.clone();
    entry.updated_at = Some(at);
    entry.clone()
}

impl Directory for MemoryStore {
    fn upsert_club(&self, club: &Club) -> Result<(), StoreError> {
        self.lock()?.clubs.insert(club.id.clone(), club.clone());
        Ok(())
    }

    fn get_club(&self, id: &str) -> Result<Option<Club>, StoreError> {
        Ok(self.lock()?.clubs.get(id).cloned())
    }

    fn list_clubs(&self) -> Result<Vec<Club>, StoreError> {
        Ok(self.lock()?.clubs.values().cloned().collect())
    }

    fn insert_subject(&self, subject: &Subject) -> Result<Option<Subject>, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.subjects.get(&subject.code) {
            return Ok(Some(existing.clone()));
        }
        inner
            .subjects
            .insert(subject.code.clone(), subject.clone());
        Ok(None)
    }

    fn get_subject(&self, code: &str) -> Result<Option<Subject>, StoreError> {
        Ok(self.lock()?.subjects.get(code).cloned())
    }

    fn list_subjects(&self) -> Result<Vec<Subject>, StoreError> {
        Ok(self.lock()?.subjects.values().cloned().collect())
    }
}

impl WindowStore for MemoryStore {
    fn insert_window(&self, window: &ApprovalWindow) -> Result<(), StoreError> {
        self.lock()?
            .windows
            .insert(window.id.clone(), window.clone());
        Ok(())
    }

    fn get_window(&self, id: &str) -> Result<Option<ApprovalWindow>, StoreError> {
        Ok(self.lock()?.windows.get(id).cloned())
    }

    fn set_window_status(&self, id: &str, status: WindowStatus) -> Result<bool, StoreError> {
        match self.lock()?.windows.get_mut(id) {
            Some(w) => {
                w.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_windows(&self, club_id: Option<&str>) -> Result<Vec<ApprovalWindow>, StoreError> {
        Ok(self
            .lock()?
            .windows
            .values()
            .filter(|w| club_id.map(|c| c == w.club_id).unwrap_or(true))
            .cloned()
            .collect())
    }
}

impl Ledger for MemoryStore {
    fn upsert(&self, write: &EntryWrite, at: DateTime<Utc>) -> Result<AttendanceEntry, StoreError> {
        Ok(upsert_in(&mut *self.lock()?, write, at))
    }

    fn upsert_all(
        &self,
        writes: &[EntryWrite],
        at: DateTime<Utc>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let mut inner = self.lock()?;
        Ok(writes.iter().map(|w| upsert_in(&mut inner, w, at)).collect())
    }

    fn find(
        &self,
        student_id: &str,
        date: NaiveDate,
        status_in: &[AttendanceStatus],
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let failing = self
            .failing_students
            .lock()
            .map(|s| s.contains(student_id))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Transient("injected".to_string()));
        }
        if let Ok(hook) = self.cancel_on_find.lock() {
            if let Some((student, token)) = hook.as_ref() {
                if student == student_id {
                    token.cancel();
                }
            }
        }
        let mut out: Vec<AttendanceEntry> = self
            .lock()?
            .entries
            .values()
            .filter(|e| {
                e.key.student_id == student_id
                    && e.key.date == date
                    && status_in.contains(&e.status)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.key.period, &a.key.subject_code).cmp(&(b.key.period, &b.key.subject_code))
        });
        Ok(out)
    }

    fn status_counts(&self, student_id: Option<&str>) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for e in self.lock()?.entries.values() {
            if student_id.map(|s| s != e.key.student_id).unwrap_or(false) {
                continue;
            }
            match e.status {
                AttendanceStatus::Present => counts.present += 1,
                AttendanceStatus::Absent => counts.absent += 1,
                AttendanceStatus::NotMarked => counts.not_marked += 1,
            }
            if e.event_name.is_some() {
                counts.event_marked += 1;
            }
        }
        Ok(counts)
    }
}

impl AuditLog for MemoryStore {
    fn record_run(&self, run: &ReconcileRun) -> Result<(), StoreError> {
        self.lock()?.runs.push(run.clone());
        Ok(())
    }

    fn list_runs(&self, club_id: Option<&str>) -> Result<Vec<ReconcileRun>, StoreError> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .filter(|r| club_id.map(|c| c == r.club_id).unwrap_or(true))
            .cloned()
            .collect())
    }
}

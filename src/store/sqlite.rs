use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AuditLog, Directory, Ledger, WindowStore};
use crate::db;
use crate::error::StoreError;
use crate::model::{
    ApprovalWindow, AttendanceEntry, AttendanceStatus, Club, EntryKey, EntryWrite, ReconcileRun,
    StatusCounts, Subject, WindowStatus,
};

/// SQLite-backed store. One connection guarded by a mutex gives the
/// single-writer-at-a-time discipline the ledger relies on.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<SqliteStore> {
        Ok(SqliteStore {
            conn: Mutex::new(db::open_db(workspace)?),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<SqliteStore> {
        Ok(SqliteStore {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Permanent("store connection poisoned".to_string()))
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| StoreError::Permanent(format!("bad stored instant {:?}: {}", raw, e)))
}

fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

struct RawWindow {
    id: String,
    club_id: String,
    event_name: String,
    start_at: String,
    end_at: String,
    status: String,
    created_by: String,
    created_at: String,
}

const WINDOW_COLUMNS: &str =
    "id, club_id, event_name, start_at, end_at, status, created_by, created_at";

fn raw_window(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawWindow> {
    Ok(RawWindow {
        id: r.get(0)?,
        club_id: r.get(1)?,
        event_name: r.get(2)?,
        start_at: r.get(3)?,
        end_at: r.get(4)?,
        status: r.get(5)?,
        created_by: r.get(6)?,
        created_at: r.get(7)?,
    })
}

impl RawWindow {
    fn decode(self) -> Result<ApprovalWindow, StoreError> {
        let status = WindowStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Permanent(format!("bad stored window status {:?}", self.status))
        })?;
        Ok(ApprovalWindow {
            start: parse_ts(&self.start_at)?,
            end: parse_ts(&self.end_at)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            club_id: self.club_id,
            event_name: self.event_name,
            status,
            created_by: self.created_by,
        })
    }
}

struct RawEntry {
    id: String,
    student_id: String,
    subject_code: String,
    date: String,
    period: i64,
    status: String,
    marked_by: String,
    event_name: Option<String>,
    updated_at: Option<String>,
}

const ENTRY_COLUMNS: &str =
    "id, student_id, subject_code, date, period, status, marked_by, event_name, updated_at";

fn raw_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: r.get(0)?,
        student_id: r.get(1)?,
        subject_code: r.get(2)?,
        date: r.get(3)?,
        period: r.get(4)?,
        status: r.get(5)?,
        marked_by: r.get(6)?,
        event_name: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

impl RawEntry {
    fn decode(self) -> Result<AttendanceEntry, StoreError> {
        let status = AttendanceStatus::from_storage(&self.status).ok_or_else(|| {
            StoreError::Permanent(format!("bad stored attendance status {:?}", self.status))
        })?;
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|_| StoreError::Permanent(format!("bad stored date {:?}", self.date)))?;
        let period = u32::try_from(self.period)
            .map_err(|_| StoreError::Permanent(format!("bad stored period {}", self.period)))?;
        let updated_at = self.updated_at.as_deref().map(parse_ts).transpose()?;
        Ok(AttendanceEntry {
            id: self.id,
            key: EntryKey {
                student_id: self.student_id,
                subject_code: self.subject_code,
                date,
                period,
            },
            status,
            marked_by: self.marked_by,
            event_name: self.event_name,
            updated_at,
        })
    }
}

fn upsert_on(
    conn: &Connection,
    write: &EntryWrite,
    at: DateTime<Utc>,
) -> Result<AttendanceEntry, StoreError> {
    let key = &write.key;
    let date = format_date(key.date);
    conn.execute(
        "INSERT INTO attendance(id, student_id, subject_code, date, period, status, marked_by, event_name, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_code, date, period) DO UPDATE SET
           status = excluded.status,
           marked_by = excluded.marked_by,
           event_name = excluded.event_name,
           updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            key.student_id,
            key.subject_code,
            date,
            key.period as i64,
            write.status.storage_code(),
            write.marked_by,
            write.event_name,
            db::format_instant(at),
        ],
    )?;
    let sql = format!(
        "SELECT {} FROM attendance
         WHERE student_id = ? AND subject_code = ? AND date = ? AND period = ?",
        ENTRY_COLUMNS
    );
    let raw = conn.query_row(
        &sql,
        rusqlite::params![key.student_id, key.subject_code, date, key.period as i64],
        raw_entry,
    )?;
    raw.decode()
}

impl Directory for SqliteStore {
    fn upsert_club(&self, club: &Club) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO clubs(id, name, leader_id) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               leader_id = excluded.leader_id",
            (&club.id, &club.name, &club.leader_id),
        )?;
        Ok(())
    }

    fn get_club(&self, id: &str) -> Result<Option<Club>, StoreError> {
        let conn = self.conn()?;
        let club = conn
            .query_row(
                "SELECT id, name, leader_id FROM clubs WHERE id = ?",
                [id],
                |r| {
                    Ok(Club {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        leader_id: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(club)
    }

    fn list_clubs(&self) -> Result<Vec<Club>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, leader_id FROM clubs ORDER BY name, id")?;
        let clubs = stmt
            .query_map([], |r| {
                Ok(Club {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    leader_id: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clubs)
    }

    fn insert_subject(&self, subject: &Subject) -> Result<Option<Subject>, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO subjects(code, name, teacher_id) VALUES(?, ?, ?)
             ON CONFLICT(code) DO NOTHING",
            (&subject.code, &subject.name, &subject.teacher_id),
        )?;
        if inserted == 1 {
            return Ok(None);
        }
        let existing = conn
            .query_row(
                "SELECT code, name, teacher_id FROM subjects WHERE code = ?",
                [&subject.code],
                |r| {
                    Ok(Subject {
                        code: r.get(0)?,
                        name: r.get(1)?,
                        teacher_id: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(existing)
    }

    fn get_subject(&self, code: &str) -> Result<Option<Subject>, StoreError> {
        let conn = self.conn()?;
        let subject = conn
            .query_row(
                "SELECT code, name, teacher_id FROM subjects WHERE code = ?",
                [code],
                |r| {
                    Ok(Subject {
                        code: r.get(0)?,
                        name: r.get(1)?,
                        teacher_id: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(subject)
    }

    fn list_subjects(&self) -> Result<Vec<Subject>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT code, name, teacher_id FROM subjects ORDER BY code")?;
        let subjects = stmt
            .query_map([], |r| {
                Ok(Subject {
                    code: r.get(0)?,
                    name: r.get(1)?,
                    teacher_id: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subjects)
    }
}

impl WindowStore for SqliteStore {
    fn insert_window(&self, w: &ApprovalWindow) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO approval_windows(id, club_id, event_name, start_at, end_at, status, created_by, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                w.id,
                w.club_id,
                w.event_name,
                db::format_instant(w.start),
                db::format_instant(w.end),
                w.status.as_str(),
                w.created_by,
                db::format_instant(w.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_window(&self, id: &str) -> Result<Option<ApprovalWindow>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM approval_windows WHERE id = ?", WINDOW_COLUMNS);
        let raw = conn.query_row(&sql, [id], raw_window).optional()?;
        raw.map(RawWindow::decode).transpose()
    }

    fn set_window_status(&self, id: &str, status: WindowStatus) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE approval_windows SET status = ? WHERE id = ?",
            (status.as_str(), id),
        )?;
        Ok(changed > 0)
    }

    fn list_windows(&self, club_id: Option<&str>) -> Result<Vec<ApprovalWindow>, StoreError> {
        let conn = self.conn()?;
        let raws = match club_id {
            Some(cid) => {
                let sql = format!(
                    "SELECT {} FROM approval_windows WHERE club_id = ? ORDER BY start_at DESC, id",
                    WINDOW_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([cid], raw_window)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM approval_windows ORDER BY start_at DESC, id",
                    WINDOW_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], raw_window)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        raws.into_iter().map(RawWindow::decode).collect()
    }
}

impl Ledger for SqliteStore {
    fn upsert(&self, write: &EntryWrite, at: DateTime<Utc>) -> Result<AttendanceEntry, StoreError> {
        let conn = self.conn()?;
        upsert_on(&conn, write, at)
    }

    fn upsert_all(
        &self,
        writes: &[EntryWrite],
        at: DateTime<Utc>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut out = Vec::with_capacity(writes.len());
        for w in writes {
            out.push(upsert_on(&tx, w, at)?);
        }
        tx.commit()?;
        Ok(out)
    }

    fn find(
        &self,
        student_id: &str,
        date: NaiveDate,
        status_in: &[AttendanceStatus],
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let codes: Vec<&str> = status_in
            .iter()
            .flat_map(|s| s.storage_codes().iter().copied())
            .collect();
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; codes.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM attendance
             WHERE student_id = ? AND date = ? AND status IN ({})
             ORDER BY period, subject_code",
            ENTRY_COLUMNS, placeholders
        );
        let mut bind: Vec<String> = vec![student_id.to_string(), format_date(date)];
        bind.extend(codes.iter().map(|c| c.to_string()));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(bind.iter()), raw_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawEntry::decode).collect()
    }

    fn status_counts(&self, student_id: Option<&str>) -> Result<StatusCounts, StoreError> {
        let conn = self.conn()?;
        let base = "SELECT status, COUNT(*), SUM(CASE WHEN event_name IS NOT NULL THEN 1 ELSE 0 END)
                    FROM attendance";
        let rows: Vec<(String, i64, i64)> = match student_id {
            Some(sid) => {
                let sql = format!("{} WHERE student_id = ? GROUP BY status", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([sid], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("{} GROUP BY status", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        let mut counts = StatusCounts::default();
        for (code, n, event_marked) in rows {
            let n = n.max(0) as u64;
            counts.event_marked += event_marked.max(0) as u64;
            match AttendanceStatus::from_storage(&code) {
                Some(AttendanceStatus::Present) => counts.present += n,
                Some(AttendanceStatus::Absent) => counts.absent += n,
                Some(AttendanceStatus::NotMarked) => counts.not_marked += n,
                None => {
                    return Err(StoreError::Permanent(format!(
                        "bad stored attendance status {:?}",
                        code
                    )))
                }
            }
        }
        Ok(counts)
    }
}

impl AuditLog for SqliteStore {
    fn record_run(&self, run: &ReconcileRun) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reconcile_runs(id, window_id, club_id, event_name, roster_sha256, roster_size, marked_count, skipped_count, ran_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                run.id,
                run.window_id,
                run.club_id,
                run.event_name,
                run.roster_sha256,
                run.roster_size as i64,
                run.marked_count as i64,
                run.skipped_count as i64,
                db::format_instant(run.ran_at),
            ],
        )?;
        Ok(())
    }

    fn list_runs(&self, club_id: Option<&str>) -> Result<Vec<ReconcileRun>, StoreError> {
        let conn = self.conn()?;
        let base = "SELECT id, window_id, club_id, event_name, roster_sha256, roster_size, marked_count, skipped_count, ran_at
                    FROM reconcile_runs";
        type RawRun = (String, String, String, String, String, i64, i64, i64, String);
        let map = |r: &rusqlite::Row<'_>| -> rusqlite::Result<RawRun> {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
            ))
        };
        let raws: Vec<RawRun> = match club_id {
            Some(cid) => {
                let sql = format!("{} WHERE club_id = ? ORDER BY ran_at DESC, id", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([cid], map)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("{} ORDER BY ran_at DESC, id", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        raws.into_iter()
            .map(|(id, window_id, club_id, event_name, sha, size, marked, skipped, ran_at)| {
                Ok(ReconcileRun {
                    id,
                    window_id,
                    club_id,
                    event_name,
                    roster_sha256: sha,
                    roster_size: size.max(0) as usize,
                    marked_count: marked.max(0) as usize,
                    skipped_count: skipped.max(0) as usize,
                    ran_at: parse_ts(&ran_at)?,
                })
            })
            .collect()
    }
}

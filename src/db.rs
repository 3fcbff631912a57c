use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "attendance.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(workspace.join(DB_FILE))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clubs(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            leader_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS approval_windows(
            id TEXT PRIMARY KEY,
            club_id TEXT NOT NULL,
            event_name TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            status TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            CHECK(start_at < end_at),
            FOREIGN KEY(club_id) REFERENCES clubs(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_approval_windows_club ON approval_windows(club_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            date TEXT NOT NULL,
            period INTEGER NOT NULL,
            status TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            event_name TEXT,
            updated_at TEXT,
            UNIQUE(student_id, subject_code, date, period)
        )",
        [],
    )?;
    // Workspaces seeded by older tooling may lack the annotation columns.
    ensure_attendance_event_name(conn)?;
    ensure_attendance_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student_date ON attendance(student_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reconcile_runs(
            id TEXT PRIMARY KEY,
            window_id TEXT NOT NULL,
            club_id TEXT NOT NULL,
            event_name TEXT NOT NULL,
            roster_sha256 TEXT NOT NULL,
            roster_size INTEGER NOT NULL,
            marked_count INTEGER NOT NULL,
            skipped_count INTEGER NOT NULL,
            ran_at TEXT NOT NULL,
            FOREIGN KEY(window_id) REFERENCES approval_windows(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reconcile_runs_club ON reconcile_runs(club_id)",
        [],
    )?;

    migrate_pending_statuses(conn)?;
    Ok(())
}

fn ensure_attendance_event_name(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "event_name")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN event_name TEXT", [])?;
    Ok(())
}

fn ensure_attendance_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn migrate_pending_statuses(conn: &Connection) -> anyhow::Result<()> {
    // "pending" was an alias for an unmarked slot; fold it into N.M.
    conn.execute(
        "UPDATE attendance SET status = 'N.M.' WHERE status = 'pending'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fixed-width UTC text so instants compare correctly as strings.
pub fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent_and_folds_pending() {
        let conn = open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO attendance(id, student_id, subject_code, date, period, status, marked_by)
             VALUES('a1', 'S1', 'CS101', '2026-03-02', 1, 'pending', 'teacher1')",
            [],
        )
        .expect("insert");
        init_schema(&conn).expect("re-run schema");
        let status: String = conn
            .query_row("SELECT status FROM attendance WHERE id = 'a1'", [], |r| {
                r.get(0)
            })
            .expect("status");
        assert_eq!(status, "N.M.");
    }

    #[test]
    fn legacy_attendance_table_gains_annotation_columns() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE attendance(
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                subject_code TEXT NOT NULL,
                date TEXT NOT NULL,
                period INTEGER NOT NULL,
                status TEXT NOT NULL,
                marked_by TEXT NOT NULL,
                UNIQUE(student_id, subject_code, date, period)
            )",
            [],
        )
        .expect("legacy table");
        init_schema(&conn).expect("migrate");
        assert!(table_has_column(&conn, "attendance", "event_name").expect("pragma"));
        assert!(table_has_column(&conn, "attendance", "updated_at").expect("pragma"));
    }
}

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::ledger::percent_from_counts;
use crate::model::{Principal, Role, StatusCounts};
use crate::store::{retry_once, Store};

/// Campus-wide view for the VC dashboard.
#[derive(Debug, Clone, PartialEq)]
pub struct CampusSummary {
    pub counts: StatusCounts,
    pub percent_present: f64,
    pub clubs: usize,
    pub open_windows: usize,
    pub reconcile_runs: usize,
}

impl CampusSummary {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "present": self.counts.present,
            "absent": self.counts.absent,
            "notMarked": self.counts.not_marked,
            "eventMarked": self.counts.event_marked,
            "percentPresent": self.percent_present,
            "clubs": self.clubs,
            "openWindows": self.open_windows,
            "reconcileRuns": self.reconcile_runs,
        })
    }
}

pub fn summary<S>(
    store: &S,
    actor: &Principal,
    now: DateTime<Utc>,
) -> Result<CampusSummary, CoreError>
where
    S: Store + ?Sized,
{
    actor.require(Role::Vc)?;
    let counts = retry_once("status_counts", || store.status_counts(None))?;
    let clubs = retry_once("list_clubs", || store.list_clubs())?.len();
    let open_windows = retry_once("list_windows", || store.list_windows(None))?
        .iter()
        .filter(|w| w.is_active_at(now))
        .count();
    let reconcile_runs = retry_once("list_runs", || store.list_runs(None))?.len();
    Ok(CampusSummary {
        percent_present: percent_from_counts(&counts),
        counts,
        clubs,
        open_windows,
        reconcile_runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceStatus, Club, EntryKey, EntryWrite};
    use crate::store::memory::MemoryStore;
    use crate::store::{Directory, Ledger};
    use crate::windows::{self, NewWindow};
    use chrono::{Duration, NaiveDate, TimeZone};

    #[test]
    fn summary_counts_event_marks_and_open_windows() {
        let store = MemoryStore::new();
        let vc = Principal {
            id: "vc".into(),
            role: Role::Vc,
        };
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        store
            .upsert_club(&Club {
                id: "club1".into(),
                name: "Tech Club".into(),
                leader_id: None,
            })
            .expect("club");
        let open = windows::create(
            &store,
            &vc,
            NewWindow {
                club_id: "club1",
                event_name: "Hackathon",
                start: t0,
                end: t0 + Duration::hours(2),
            },
            t0,
        )
        .expect("open window");
        windows::create(
            &store,
            &vc,
            NewWindow {
                club_id: "club1",
                event_name: "Old fest",
                start: t0 - Duration::days(3),
                end: t0 - Duration::days(2),
            },
            t0,
        )
        .expect("past window");

        let date = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        for (student, status, event) in [
            ("S1", AttendanceStatus::Present, Some(open.event_name.clone())),
            ("S2", AttendanceStatus::Absent, None),
            ("S3", AttendanceStatus::NotMarked, None),
        ] {
            store
                .upsert(
                    &EntryWrite {
                        key: EntryKey {
                            student_id: student.into(),
                            subject_code: "CS101".into(),
                            date,
                            period: 1,
                        },
                        status,
                        marked_by: "teacher1".into(),
                        event_name: event,
                    },
                    t0,
                )
                .expect("entry");
        }

        let s = summary(&store, &vc, t0 + Duration::hours(1)).expect("summary");
        assert_eq!(s.counts.present, 1);
        assert_eq!(s.counts.absent, 1);
        assert_eq!(s.counts.not_marked, 1);
        assert_eq!(s.counts.event_marked, 1);
        assert_eq!(s.percent_present, 50.0);
        assert_eq!(s.clubs, 1);
        assert_eq!(s.open_windows, 1);

        let club = Principal {
            id: "club1".into(),
            role: Role::Club,
        };
        assert!(matches!(
            summary(&store, &club, t0),
            Err(CoreError::Forbidden(_))
        ));
    }
}

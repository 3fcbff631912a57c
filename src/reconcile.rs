use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::model::{
    ApprovalWindow, AttendanceStatus, EntryWrite, Principal, ReconcileRun, Role, RosterEntry,
    SkipReason, Skipped,
};
use crate::store::{retry_once, Store};

pub const DEFAULT_WORKERS: usize = 4;

/// Shared flag checked between identifiers. Tripping it stops new work;
/// identifiers already promoted stay promoted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub workers: usize,
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            workers: DEFAULT_WORKERS,
            cancel: CancelToken::new(),
            deadline: None,
        }
    }
}

impl ReconcileOptions {
    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => {
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

pub struct ReconcileRequest<'a> {
    pub window_id: &'a str,
    /// Falls back to the window's event name when absent or blank.
    pub event_name: Option<&'a str>,
    pub roster: &'a [RosterEntry],
    pub roster_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub run_id: Option<String>,
    pub window_id: String,
    pub event_name: String,
    pub today: NaiveDate,
    pub marked_count: usize,
    pub skipped: Vec<Skipped>,
}

impl ReconcileOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        let skipped: Vec<serde_json::Value> = self
            .skipped
            .iter()
            .map(|s| {
                serde_json::json!({
                    "row": s.row,
                    "identifier": s.identifier,
                    "reason": s.reason,
                })
            })
            .collect();
        serde_json::json!({
            "runId": self.run_id,
            "windowId": self.window_id,
            "eventName": self.event_name,
            "date": self.today.format("%Y-%m-%d").to_string(),
            "markedCount": self.marked_count,
            "skipped": skipped,
        })
    }
}

#[derive(Default)]
struct Tally {
    marked: usize,
    skipped: Vec<Skipped>,
}

struct Job<'a> {
    club_id: &'a str,
    event_name: &'a str,
    today: NaiveDate,
    now: DateTime<Utc>,
}

/// Promotes today's undecided entries of every roster student to Present.
///
/// The window check is the only hard failure and happens before any ledger
/// access. After it passes, per-identifier problems become skip entries and
/// the call succeeds with whatever was completed.
pub fn reconcile<S>(
    store: &S,
    clock: &dyn Clock,
    actor: &Principal,
    req: ReconcileRequest<'_>,
    options: &ReconcileOptions,
) -> Result<ReconcileOutcome, CoreError>
where
    S: Store + ?Sized,
{
    actor.require(Role::Club)?;
    let now = clock.now();
    let window = active_window(store, actor, req.window_id, now)?;
    let event_name = req
        .event_name
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .unwrap_or(window.event_name.as_str())
        .to_string();
    let today = now.date_naive();

    let mut tally = Tally::default();
    let mut seen = HashSet::new();
    let mut unique: Vec<&RosterEntry> = Vec::with_capacity(req.roster.len());
    for entry in req.roster {
        if seen.insert(entry.identifier.as_str()) {
            unique.push(entry);
        } else {
            tally.skipped.push(Skipped {
                row: entry.row,
                identifier: entry.identifier.clone(),
                reason: SkipReason::DuplicateIdentifier,
            });
        }
    }

    info!(
        window_id = %window.id,
        club_id = %actor.id,
        event = %event_name,
        students = unique.len(),
        "reconciliation started"
    );

    let job = Job {
        club_id: actor.id.as_str(),
        event_name: event_name.as_str(),
        today,
        now,
    };
    let workers = options.workers.clamp(1, unique.len().max(1));
    let next = AtomicUsize::new(0);
    let (job, entries, next) = (&job, unique.as_slice(), &next);
    let partials = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(move || run_worker(store, job, entries, next, options)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join())
            .collect::<Result<Vec<Tally>, _>>()
    })
    .map_err(|_| CoreError::Internal("reconciliation worker panicked".to_string()))?;

    for part in partials {
        tally.marked += part.marked;
        tally.skipped.extend(part.skipped);
    }
    tally
        .skipped
        .sort_by(|a, b| (a.row, &a.identifier).cmp(&(b.row, &b.identifier)));

    let cancelled = tally
        .skipped
        .iter()
        .filter(|s| s.reason == SkipReason::Cancelled)
        .count();
    if cancelled > 0 {
        warn!(window_id = %window.id, cancelled, "reconciliation cancelled before finishing");
    }

    let run = ReconcileRun {
        id: Uuid::new_v4().to_string(),
        window_id: window.id.clone(),
        club_id: actor.id.clone(),
        event_name: event_name.clone(),
        roster_sha256: req.roster_sha256,
        roster_size: req.roster.len(),
        marked_count: tally.marked,
        skipped_count: tally.skipped.len(),
        ran_at: now,
    };
    // Ledger writes are already committed; a lost audit row must not turn
    // the call into a failure.
    let run_id = match retry_once("record_run", || store.record_run(&run)) {
        Ok(()) => Some(run.id.clone()),
        Err(e) => {
            warn!(window_id = %window.id, error = %e, "failed to record reconciliation run");
            None
        }
    };

    info!(
        window_id = %window.id,
        marked = tally.marked,
        skipped = tally.skipped.len(),
        "reconciliation finished"
    );
    Ok(ReconcileOutcome {
        run_id,
        window_id: window.id,
        event_name,
        today,
        marked_count: tally.marked,
        skipped: tally.skipped,
    })
}

/// Audit log of past runs. Clubs see their own runs; the VC may filter by
/// club or see everything.
pub fn history<S>(
    store: &S,
    actor: &Principal,
    club_id: Option<&str>,
) -> Result<Vec<ReconcileRun>, CoreError>
where
    S: Store + ?Sized,
{
    let scope = match actor.role {
        Role::Club => {
            if club_id.map(|c| c != actor.id).unwrap_or(false) {
                return Err(CoreError::Forbidden(
                    "clubs may only read their own reconciliation history".to_string(),
                ));
            }
            Some(actor.id.as_str())
        }
        Role::Vc => club_id,
        _ => {
            return Err(CoreError::Forbidden(format!(
                "{} principal cannot read reconciliation history",
                actor.role.as_str()
            )))
        }
    };
    retry_once("list_runs", || store.list_runs(scope))
}

fn active_window<S>(
    store: &S,
    actor: &Principal,
    window_id: &str,
    now: DateTime<Utc>,
) -> Result<ApprovalWindow, CoreError>
where
    S: Store + ?Sized,
{
    let window = retry_once("get_window", || store.get_window(window_id))?
        .ok_or_else(|| CoreError::WindowInactive(window_id.to_string()))?;
    if window.club_id != actor.id {
        return Err(CoreError::Forbidden(format!(
            "approval window {} belongs to another club",
            window.id
        )));
    }
    if !window.is_active_at(now) {
        return Err(CoreError::WindowInactive(window.id));
    }
    Ok(window)
}

fn run_worker<S>(
    store: &S,
    job: &Job<'_>,
    entries: &[&RosterEntry],
    next: &AtomicUsize,
    options: &ReconcileOptions,
) -> Tally
where
    S: Store + ?Sized,
{
    let mut local = Tally::default();
    loop {
        let i = next.fetch_add(1, Ordering::SeqCst);
        let Some(entry) = entries.get(i) else {
            break;
        };
        let skip = |reason| Skipped {
            row: entry.row,
            identifier: entry.identifier.clone(),
            reason,
        };
        if options.should_stop() {
            local.skipped.push(skip(SkipReason::Cancelled));
            continue;
        }
        let (marked, reason) = promote(store, job, &entry.identifier);
        local.marked += marked;
        if let Some(reason) = reason {
            local.skipped.push(skip(reason));
        }
    }
    local
}

/// Marks one student's undecided entries for today. Returns how many were
/// written and, if the student could not be fully handled, why.
fn promote<S>(store: &S, job: &Job<'_>, student_id: &str) -> (usize, Option<SkipReason>)
where
    S: Store + ?Sized,
{
    let eligible = match retry_once("find", || {
        store.find(student_id, job.today, &AttendanceStatus::UNDECIDED)
    }) {
        Ok(v) => v,
        Err(e) => {
            warn!(student_id, error = %e, "ledger lookup failed");
            return (0, Some(SkipReason::StoreUnavailable));
        }
    };
    if eligible.is_empty() {
        return (0, Some(SkipReason::NoScheduledPeriod));
    }

    let mut marked = 0;
    for entry in eligible {
        let write = EntryWrite {
            key: entry.key,
            status: AttendanceStatus::Present,
            marked_by: job.club_id.to_string(),
            event_name: Some(job.event_name.to_string()),
        };
        match retry_once("upsert", || store.upsert(&write, job.now)) {
            Ok(_) => marked += 1,
            Err(e) => {
                warn!(student_id, error = %e, "ledger upsert failed");
                return (marked, Some(SkipReason::StoreUnavailable));
            }
        }
    }
    (marked, None)
}

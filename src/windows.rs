use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{ApprovalWindow, Principal, Role, WindowStatus};
use crate::store::{retry_once, Directory, WindowStore};

pub struct NewWindow<'a> {
    pub club_id: &'a str,
    pub event_name: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Grants a club a permission window. Windows are created approved; there
/// is no separate approval step. Overlapping windows for one club are
/// allowed since each reconciliation names its window explicitly.
pub fn create<S>(
    store: &S,
    actor: &Principal,
    new: NewWindow<'_>,
    now: DateTime<Utc>,
) -> Result<ApprovalWindow, CoreError>
where
    S: Directory + WindowStore + ?Sized,
{
    actor.require(Role::Vc)?;

    let club_id = new.club_id.trim();
    let event_name = new.event_name.trim();
    if club_id.is_empty() {
        return Err(CoreError::Validation("clubId must not be empty".to_string()));
    }
    if event_name.is_empty() {
        return Err(CoreError::Validation(
            "eventName must not be empty".to_string(),
        ));
    }
    if new.start >= new.end {
        return Err(CoreError::Validation(format!(
            "window start {} must be before end {}",
            new.start.to_rfc3339(),
            new.end.to_rfc3339()
        )));
    }
    if retry_once("get_club", || store.get_club(club_id))?.is_none() {
        return Err(CoreError::NotFound(format!("club not found: {}", club_id)));
    }

    let window = ApprovalWindow {
        id: Uuid::new_v4().to_string(),
        club_id: club_id.to_string(),
        event_name: event_name.to_string(),
        start: new.start,
        end: new.end,
        status: WindowStatus::Approved,
        created_by: actor.id.clone(),
        created_at: now,
    };
    retry_once("insert_window", || store.insert_window(&window))?;
    info!(
        window_id = %window.id,
        club_id = %window.club_id,
        event = %window.event_name,
        "approval window created"
    );
    Ok(window)
}

/// Sets status to revoked whatever it was. Revoking twice is not an error.
pub fn revoke<S>(store: &S, actor: &Principal, window_id: &str) -> Result<ApprovalWindow, CoreError>
where
    S: WindowStore + ?Sized,
{
    actor.require(Role::Vc)?;
    let found = retry_once("set_window_status", || {
        store.set_window_status(window_id, WindowStatus::Revoked)
    })?;
    if !found {
        return Err(CoreError::NotFound(format!(
            "approval window not found: {}",
            window_id
        )));
    }
    let window = retry_once("get_window", || store.get_window(window_id))?
        .ok_or_else(|| CoreError::NotFound(format!("approval window not found: {}", window_id)))?;
    info!(window_id = %window.id, club_id = %window.club_id, "approval window revoked");
    Ok(window)
}

/// Point-in-time check read straight from the store on every call; an
/// unknown id is simply not active.
pub fn is_active<S>(store: &S, window_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError>
where
    S: WindowStore + ?Sized,
{
    let window = retry_once("get_window", || store.get_window(window_id))?;
    Ok(window.map(|w| w.is_active_at(at)).unwrap_or(false))
}

pub fn get<S>(store: &S, window_id: &str) -> Result<ApprovalWindow, CoreError>
where
    S: WindowStore + ?Sized,
{
    retry_once("get_window", || store.get_window(window_id))?
        .ok_or_else(|| CoreError::NotFound(format!("approval window not found: {}", window_id)))
}

/// Clubs only see their own windows; everyone else may filter freely.
pub fn list<S>(
    store: &S,
    actor: &Principal,
    club_id: Option<&str>,
    active_only: bool,
    now: DateTime<Utc>,
) -> Result<Vec<ApprovalWindow>, CoreError>
where
    S: WindowStore + ?Sized,
{
    let scope = match actor.role {
        Role::Club => {
            if let Some(requested) = club_id {
                if requested != actor.id {
                    return Err(CoreError::Forbidden(
                        "clubs may only list their own windows".to_string(),
                    ));
                }
            }
            Some(actor.id.as_str())
        }
        _ => club_id,
    };
    let mut windows = retry_once("list_windows", || store.list_windows(scope))?;
    if active_only {
        windows.retain(|w| w.is_active_at(now));
    }
    Ok(windows)
}

use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{anyhow, bail};
use tracing::{debug, info};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 6 * 1024 * 1024;
pub const MAX_RECONCILE_WORKERS: usize = 32;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workspace: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub reconcile_workers: usize,
    /// 0 means no deadline.
    pub reconcile_deadline_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            workspace: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            reconcile_workers: crate::reconcile::DEFAULT_WORKERS,
            reconcile_deadline_ms: 0,
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let workspace = lookup("ATTENDD_WORKSPACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let max_upload_bytes: usize = try_load(&lookup, "ATTENDD_MAX_UPLOAD_BYTES", "6291456")?;
        if max_upload_bytes == 0 {
            bail!("ATTENDD_MAX_UPLOAD_BYTES must be greater than 0");
        }
        let workers: usize = try_load(&lookup, "ATTENDD_RECONCILE_WORKERS", "4")?;
        Ok(AppConfig {
            workspace,
            max_upload_bytes,
            reconcile_workers: workers.clamp(1, MAX_RECONCILE_WORKERS),
            reconcile_deadline_ms: try_load(&lookup, "ATTENDD_RECONCILE_DEADLINE_MS", "0")?,
        })
    }
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key).unwrap_or_else(|| {
        debug!("{key} not set, using default: {default}");
        default.to_string()
    });
    let value = raw
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid {key} value {raw:?}: {e}"))?;
    info!("{key} = {}", raw.trim());
    Ok(value)
}

use std::path::PathBuf;

use serde::Deserialize;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::store::SqliteStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<SqliteStore>,
    pub config: AppConfig,
    pub clock: Box<dyn Clock>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        AppState {
            workspace: None,
            store: None,
            config,
            clock: Box::new(SystemClock),
        }
    }
}

mod clock;
mod config;
mod db;
mod error;
mod ipc;
mod ledger;
mod model;
mod reconcile;
mod reports;
mod roster;
mod store;
mod windows;

use std::env;
use std::io::{self, BufRead, Write};

use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Logs go to stderr; stdout carries one JSON response per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ATTENDD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("ATTENDD_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let builder = fmt().with_env_filter(filter).with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    init_tracing();

    let config = match config::AppConfig::load() {
        Ok(v) => v,
        Err(e) => {
            error!("configuration rejected: {e:#}");
            std::process::exit(2);
        }
    };
    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            error!("ATTENDD_WORKSPACE not opened: {e:#}");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "attendd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // No id to echo back.
            Err(e) => ipc::err("", "bad_json", 400, e.to_string(), None),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}

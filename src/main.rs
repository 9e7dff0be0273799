mod admission;
mod auth;
mod calendar;
mod compiler;
mod db;
mod error;
mod grading;
mod ipc;
mod logging;
mod roster;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;

/// School records sidecar: newline-delimited JSON requests on stdin,
/// one response line per request on stdout.
#[derive(Debug, Parser)]
#[command(name = "schoold", version)]
struct Cli {
    /// Open this workspace directory before reading requests
    #[arg(long, env = "SCHOOLD_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Log level or filter directive (e.g. `info`, `schoold=trace`)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init_tracing(cli.verbose, cli.log_level.as_deref(), cli.log_json) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace {
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "workspace opened at startup");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => {
                tracing::error!(workspace = %path.display(), error = ?e, "failed to open workspace")
            }
        }
    }

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

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer with.
                tracing::warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::debug!("stdin closed, exiting");
}

mod client;
mod config;
#[cfg(test)]
mod fake_peer;
mod paths;
mod protocol;
mod session;

use std::sync::Arc;

use tokio::time::sleep;

use crate::client::ClientContext;
use crate::config::Config;

#[tokio::main]
async fn main() {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        eprintln!("[daemon] Config error (using defaults): {e}");
        Config::default()
    });

    println!("unbell-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Supervisor ────────────────────────────────────────────────────────────
    tokio::select! {
        _ = supervise(config) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    println!("Shutting down");
}

/// Reconnect supervisor: run one session to completion, back off a fixed
/// delay, repeat forever. iTerm2 quitting, restarting, or never having
/// been there in the first place all land in the same retry path; only
/// process shutdown ends the loop.
async fn supervise(config: Config) {
    let backoff = config.connection.effective_backoff();
    loop {
        run_session(&config).await;
        println!("[daemon] Retrying in {}ms", backoff.as_millis());
        sleep(backoff).await;
    }
}

/// One supervisor iteration: fresh client state, at most one connection
/// lifetime, guaranteed-invalid state afterwards.
async fn run_session(config: &Config) {
    // A fresh context per attempt: nothing a previous session registered
    // (listeners, pending replies, cached snapshots) can reach this one.
    let ctx = Arc::new(ClientContext::new());

    match client::open(&config.connection, Arc::clone(&ctx)).await {
        Ok((conn, reader)) => {
            println!("[daemon] Connected to iTerm2");
            let conn = Arc::new(conn);
            session::run(
                Arc::clone(&conn),
                reader,
                config.reset.effective_interval(),
            )
            .await;
            conn.close().await;
            println!("[daemon] Session ended");
        }
        Err(e) => eprintln!("[daemon] Connect failed: {e}"),
    }

    // Wake anything still suspended on this session's state.
    ctx.invalidate();
}

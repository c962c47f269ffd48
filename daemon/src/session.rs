/// One connection lifetime: dispatch loop, focus consumer, and periodic
/// reset running concurrently until the first of them finishes (normally
/// the dispatch loop returning because iTerm2 went away). Whatever ends
/// first, the session unwinds the other tasks completely before returning,
/// so nothing leaks into the supervisor's next attempt.
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::client::{self, Connection, FrameReader};
use crate::protocol::TabSnapshot;

/// OSC 6 escape that returns a tab's color to the profile default.
pub const RESET_ESCAPE: &str = "\x1b]6;1;bg;*;default\x07";

/// Runs one session to completion. Always returns normally: a dead
/// connection is an expected event, recovered by the supervisor, not an
/// error of the session itself.
pub async fn run(conn: Arc<Connection>, reader: FrameReader, reset_period: Duration) {
    let ctx = Arc::clone(conn.context());
    let mut dispatch = tokio::spawn(client::dispatch_forever(reader, ctx));
    let mut focus = tokio::spawn(focus_reset(Arc::clone(&conn)));
    let mut ticker = tokio::spawn(periodic_reset(Arc::clone(&conn), reset_period));

    tokio::select! {
        _ = &mut dispatch => eprintln!("[session] Dispatch loop ended"),
        _ = &mut focus => eprintln!("[session] Focus consumer ended"),
        _ = &mut ticker => eprintln!("[session] Periodic reset ended"),
    }

    for handle in [dispatch, focus, ticker] {
        handle.abort();
        // Wait for the cancellation to land; no task may outlive the session.
        let _ = handle.await;
    }
}

/// Clears the bell marker on every session of `tab`: inject the reset
/// escape, then turn the tab-color profile property off. Both are no-ops
/// on a tab that was never marked. Send failures are ignored; the action
/// is idempotent and the next reset repeats it anyway.
pub async fn clear_tab(conn: &Connection, tab: &TabSnapshot) {
    for session_id in &tab.sessions {
        let _ = conn.inject(session_id, RESET_ESCAPE).await;
        let _ = conn.set_tab_color(session_id, false).await;
    }
}

/// Consumes focus-change updates and clears the newly selected tab.
async fn focus_reset(conn: Arc<Connection>) {
    let mut events = match conn.subscribe_focus().await {
        Ok(events) => events,
        Err(e) => {
            eprintln!("[session] Focus subscription failed: {e}");
            return;
        }
    };

    loop {
        let Ok(update) = events.next_update().await else {
            // SubscriptionClosed: the session is unwinding.
            return;
        };
        println!("[session] Tab switched: {}", update.tab_id);
        // Re-resolve against a fresh snapshot; tab ids are never trusted
        // across snapshots, let alone reconnects.
        match conn.resolve_target(&update.tab_id).await {
            Ok(Some(tab)) => clear_tab(&conn, &tab).await,
            Ok(None) => {}
            Err(e) => eprintln!("[session] Focus reset failed: {e}"),
        }
    }
}

/// Unconditionally clears the focused tab's color every `period`. Covers
/// BEL ringing on the already-focused tab, which produces no focus event.
///
/// A failed tick is simply wasted: the state it read was stale or the
/// connection is on its way down, and the next tick retries fresh.
async fn periodic_reset(conn: Arc<Connection>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of `interval` fires immediately; skip it so the
    // cadence is sleep-then-reset.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Ok(Some(tab)) = conn.focused_tab().await {
            clear_tab(&conn, &tab).await;
        }
    }
}

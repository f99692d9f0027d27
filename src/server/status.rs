//! The `/status` page.
//!
//! A small, dependency-free HTML rendering of the daemon counters. The
//! page is meant for a human glancing at a browser tab, not for machine
//! consumption.

use chrono::{DateTime, Utc};

use crate::stats::StatsSnapshot;

/// Renders the status page for a counter snapshot.
pub fn render(snapshot: &StatsSnapshot) -> String {
    let last_failure = snapshot
        .last_failure
        .map(format_time)
        .unwrap_or_else(|| "never".to_string());

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>gitlab-hookd status</title></head>\n\
         <body>\n\
         <h1>gitlab-hookd</h1>\n\
         <p>Running since {started}.</p>\n\
         <table>\n\
         <tr><td>Requests received</td><td>{requests}</td></tr>\n\
         <tr><td>Well-formed requests</td><td>{valid}</td></tr>\n\
         <tr><td>Actions scheduled</td><td>{scheduled}</td></tr>\n\
         <tr><td>Actions executed</td><td>{executed}</td></tr>\n\
         <tr><td>Actions failed</td><td>{failed}</td></tr>\n\
         <tr><td>Last failure</td><td>{last_failure}</td></tr>\n\
         </table>\n\
         </body>\n\
         </html>\n",
        started = format_time(snapshot.started_at),
        requests = snapshot.requests_received,
        valid = snapshot.requests_valid,
        scheduled = snapshot.actions_scheduled,
        executed = snapshot.actions_executed,
        failed = snapshot.actions_failed,
        last_failure = last_failure,
    )
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

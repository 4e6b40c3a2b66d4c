use chrono::{DateTime, Utc};
use std::str::FromStr;
use taskloop_contracts::TriggerSpec;

/// `cron` expects a 6- or 7-field expression (seconds first); most operators
/// write jobs in the 5-field POSIX form (`0 2 * * *`), so a bare seconds
/// field of `0` is prepended when the expression doesn't already carry one.
/// Mirrors how APScheduler's `CronTrigger` accepts the shorter POSIX form
/// and fills in the missing precision internally.
fn normalize_cron_expr(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count <= 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Computes the next fire time strictly after `after`, or `None` if the
/// trigger can never fire again (an exhausted `date` trigger, or a
/// malformed `cron` expression).
pub fn next_run_after(trigger: &TriggerSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        TriggerSpec::Cron { expr } => {
            let normalized = normalize_cron_expr(expr);
            let schedule = cron::Schedule::from_str(&normalized)
                .map_err(|e| tracing::warn!(expr = %expr, error = %e, "invalid cron expression"))
                .ok()?;
            schedule.after(&after).next()
        }
        TriggerSpec::Interval { period_seconds } => {
            if *period_seconds <= 0 {
                None
            } else {
                Some(after + chrono::Duration::seconds(*period_seconds))
            }
        }
        TriggerSpec::Date { at } => {
            if *at > after {
                Some(*at)
            } else {
                None
            }
        }
    }
}

/// Finds the most recent occurrence of `trigger` that falls in
/// `(now - grace_seconds, now]`: a fire time the scheduler missed while it
/// was down (or busy) but that is still within the misfire grace window, and
/// so must be fired exactly once rather than silently skipped in favor of
/// the next future occurrence (§4.6 misfire coalescing).
///
/// Returns `None` when nothing was missed within the window — either the
/// trigger has no occurrence there, or `grace_seconds` is non-positive.
pub fn catch_up_occurrence(trigger: &TriggerSpec, now: DateTime<Utc>, grace_seconds: i64) -> Option<DateTime<Utc>> {
    if grace_seconds <= 0 {
        return None;
    }
    let window_start = now - chrono::Duration::seconds(grace_seconds);
    let mut cursor = window_start;
    let mut last_due = None;
    while let Some(candidate) = next_run_after(trigger, cursor) {
        if candidate > now {
            break;
        }
        last_due = Some(candidate);
        cursor = candidate;
    }
    last_due
}

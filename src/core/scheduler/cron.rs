use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Duration, DurationRound, Utc};
use chrono_tz::Tz;
use croner::Cron;

/// Parse a standard 5-field cron expression (minute hour dom month dow).
pub fn parse_schedule(expr: &str) -> Result<Cron> {
    let expr = expr.trim();
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        bail!(
            "Invalid cron expression '{}': expected 5 fields, found {}",
            expr,
            fields
        );
    }
    expr.parse::<Cron>()
        .map_err(|e| anyhow!("Invalid cron expression '{}': {}", expr, e))
}

pub fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    match name.map(str::trim) {
        None | Some("") => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| anyhow!("Unknown timezone '{}'", name)),
    }
}

fn minute_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or(t)
}

/// First fire time strictly after `from`, evaluated in `tz`.
pub fn next_run_time(expr: &str, from: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let cron = parse_schedule(expr)?;
    let local = from.with_timezone(&tz);
    let next = cron
        .find_next_occurrence(&local, false)
        .map_err(|e| anyhow!("No upcoming run for '{}': {}", expr, e))?;
    Ok(next.with_timezone(&Utc))
}

/// Whether the schedule fires in the minute containing `now` and has not
/// already run in that minute. A `last_run` in the future counts as run.
pub fn is_due(expr: &str, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<bool> {
    is_due_in(expr, Tz::UTC, last_run, now)
}

pub fn is_due_in(
    expr: &str,
    tz: Tz,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let start = minute_start(now);
    let next = next_run_time(expr, start - Duration::seconds(1), tz)?;
    if next < start || next >= start + Duration::seconds(60) {
        return Ok(false);
    }
    Ok(match last_run {
        None => true,
        Some(last) => minute_start(last) < start,
    })
}

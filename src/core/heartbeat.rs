//! Periodic heartbeat prompts for agents, gated by an optional active-hours window.

use chrono::{DateTime, Local, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::core::queue::InboundMessage;

pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

pub const DEFAULT_HEARTBEAT_PROMPT: &str = "Heartbeat check: review your pending work and notes. \
If something needs attention, act on it; otherwise reply briefly that all is well.";

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([01]\d|2[0-3]):([0-5]\d)|24:00)$").expect("HH:MM regex must compile")
});

/// Daily window in which heartbeats may fire. `end` before `start` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveHours {
    pub start: String,
    pub end: String,
    /// IANA name; unset or "local" uses the host timezone.
    #[serde(default)]
    pub timezone: Option<String>,
}

enum Zone {
    Local,
    Named(Tz),
}

fn parse_time_minutes(raw: &str, allow_24: bool) -> Option<u32> {
    let raw = raw.trim();
    if !TIME_RE.is_match(raw) {
        return None;
    }
    let (hour, minute) = raw.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour == 24 {
        return allow_24.then_some(24 * 60);
    }
    Some(hour * 60 + minute)
}

impl ActiveHours {
    pub fn validate(&self) -> Result<(), String> {
        if parse_time_minutes(&self.start, false).is_none() {
            return Err(format!("start '{}' is not a HH:MM time", self.start));
        }
        if parse_time_minutes(&self.end, true).is_none() {
            return Err(format!("end '{}' is not a HH:MM time", self.end));
        }
        self.zone().map(|_| ())
    }

    fn zone(&self) -> Result<Zone, String> {
        match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Ok(Zone::Local),
            Some(v) if v.eq_ignore_ascii_case("local") => Ok(Zone::Local),
            Some(v) => v
                .parse::<Tz>()
                .map(Zone::Named)
                .map_err(|_| format!("unknown timezone '{}'", v)),
        }
    }

    /// Malformed windows allow everything; config validation reports them earlier.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (
            parse_time_minutes(&self.start, false),
            parse_time_minutes(&self.end, true),
        ) else {
            return true;
        };
        if start == end {
            return false;
        }
        let current = match self.zone() {
            Ok(Zone::Named(tz)) => {
                let t = now.with_timezone(&tz);
                t.hour() * 60 + t.minute()
            }
            Ok(Zone::Local) => {
                let t = now.with_timezone(&Local);
                t.hour() * 60 + t.minute()
            }
            Err(_) => return true,
        };
        if end > start {
            current >= start && current < end
        } else {
            current >= start || current < end
        }
    }
}

pub fn within_active_hours(hours: Option<&ActiveHours>, now: DateTime<Utc>) -> bool {
    hours.is_none_or(|h| h.contains(now))
}

/// Tracks when each agent last received a heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    last_fired: HashMap<String, Instant>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// An agent that never fired waits one full interval from its first check.
    pub fn is_due(&mut self, agent_id: &str, interval: Duration, now: Instant) -> bool {
        let last = *self.last_fired.entry(agent_id.to_string()).or_insert(now);
        now.duration_since(last) >= interval
    }

    pub fn mark_fired(&mut self, agent_id: &str, now: Instant) {
        self.last_fired.insert(agent_id.to_string(), now);
    }
}

pub async fn read_prompt(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_HEARTBEAT_PROMPT.to_string();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => DEFAULT_HEARTBEAT_PROMPT.to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DEFAULT_HEARTBEAT_PROMPT.to_string(),
        Err(e) => {
            warn!("Failed to read heartbeat prompt {:?}: {}", path, e);
            DEFAULT_HEARTBEAT_PROMPT.to_string()
        }
    }
}

pub fn heartbeat_message(agent_id: &str, prompt: String) -> InboundMessage {
    InboundMessage::new(HEARTBEAT_CHANNEL, "heartbeat", "heartbeat", prompt).with_agent(agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hours(start: &str, end: &str, tz: Option<&str>) -> ActiveHours {
        ActiveHours {
            start: start.into(),
            end: end.into(),
            timezone: tz.map(str::to_string),
        }
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn daytime_window() {
        let h = hours("08:00", "22:00", Some("UTC"));
        assert!(!h.contains(utc(7, 59)));
        assert!(h.contains(utc(8, 0)));
        assert!(h.contains(utc(21, 59)));
        assert!(!h.contains(utc(22, 0)));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let h = hours("22:00", "06:00", Some("UTC"));
        assert!(h.contains(utc(23, 30)));
        assert!(h.contains(utc(2, 0)));
        assert!(!h.contains(utc(12, 0)));
    }

    #[test]
    fn equal_bounds_never_active() {
        assert!(!hours("09:00", "09:00", Some("UTC")).contains(utc(9, 0)));
    }

    #[test]
    fn end_of_day_accepts_24_00() {
        let h = hours("00:00", "24:00", Some("UTC"));
        assert!(h.validate().is_ok());
        assert!(h.contains(utc(23, 59)));
    }

    #[test]
    fn named_timezone_shifts_the_window() {
        // 07:30 UTC is 08:30 in Berlin during winter time.
        let h = hours("08:00", "09:00", Some("Europe/Berlin"));
        assert!(h.contains(utc(7, 30)));
        assert!(!h.contains(utc(8, 30)));
    }

    #[test]
    fn validation_rejects_bad_times_and_zones() {
        assert!(hours("8am", "22:00", None).validate().is_err());
        assert!(hours("24:00", "22:00", None).validate().is_err());
        assert!(hours("08:00", "22:00", Some("Mars/Olympus")).validate().is_err());
        assert!(hours("08:00", "22:00", Some("local")).validate().is_ok());
    }

    #[test]
    fn missing_window_always_allows() {
        assert!(within_active_hours(None, utc(3, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_waits_one_interval_per_agent() {
        let mut tracker = HeartbeatTracker::new();
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();

        assert!(!tracker.is_due("a", interval, t0));
        assert!(!tracker.is_due("a", interval, t0 + Duration::from_secs(59)));
        assert!(tracker.is_due("a", interval, t0 + Duration::from_secs(60)));

        tracker.mark_fired("a", t0 + Duration::from_secs(60));
        assert!(!tracker.is_due("a", interval, t0 + Duration::from_secs(90)));
        assert!(!tracker.is_due("b", interval, t0 + Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn prompt_falls_back_to_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("heartbeat.md");
        assert_eq!(read_prompt(Some(&missing)).await, DEFAULT_HEARTBEAT_PROMPT);

        std::fs::write(&missing, "  \n").unwrap();
        assert_eq!(read_prompt(Some(&missing)).await, DEFAULT_HEARTBEAT_PROMPT);

        std::fs::write(&missing, "Check the inbox.\n").unwrap();
        assert_eq!(read_prompt(Some(&missing)).await, "Check the inbox.");
        assert_eq!(read_prompt(None).await, DEFAULT_HEARTBEAT_PROMPT);
    }

    #[test]
    fn heartbeat_message_targets_agent() {
        let msg = heartbeat_message("assistant", "ping".into());
        assert_eq!(msg.channel, HEARTBEAT_CHANNEL);
        assert_eq!(msg.agent.as_deref(), Some("assistant"));
    }
}

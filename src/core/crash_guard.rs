//! Sliding-window crash counter used to refuse restarts during a crash loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashStats {
    pub total: usize,
    pub recent: usize,
    pub oldest_recent: Option<DateTime<Utc>>,
}

pub struct CrashGuard {
    path: PathBuf,
    max_crashes: usize,
    window: Duration,
}

impl CrashGuard {
    pub fn new(path: impl Into<PathBuf>, max_crashes: usize, window: Duration) -> Self {
        Self {
            path: path.into(),
            max_crashes,
            window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_crash(&self, reason: Option<&str>) -> Result<()> {
        self.record_crash_at(Utc::now(), reason)
    }

    /// Appends to the log. An unparsable log is moved to `<log>.corrupt`
    /// first so its contents survive.
    pub fn record_crash_at(&self, at: DateTime<Utc>, reason: Option<&str>) -> Result<()> {
        let mut records = match self.read_log() {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                let aside = self.corrupt_path();
                warn!(
                    "Crash log {:?} is unreadable ({}), moving it to {:?}",
                    self.path, e, aside
                );
                std::fs::rename(&self.path, &aside)?;
                Vec::new()
            }
            None => Vec::new(),
        };
        records.push(CrashRecord {
            timestamp: at,
            reason: reason.map(str::to_string),
        });
        self.store(&records)
    }

    pub fn should_allow_restart(&self) -> RestartDecision {
        self.should_allow_restart_at(Utc::now())
    }

    pub fn should_allow_restart_at(&self, now: DateTime<Utc>) -> RestartDecision {
        let recent = self.recent(&self.load(), now).len();
        if recent < self.max_crashes {
            return RestartDecision {
                allowed: true,
                reason: None,
            };
        }
        RestartDecision {
            allowed: false,
            reason: Some(format!(
                "{} crash{} in the last {} (limit {}). Fix the cause, then run `chatrelay crashes clear`.",
                recent,
                if recent == 1 { "" } else { "es" },
                human_duration(self.window),
                self.max_crashes
            )),
        }
    }

    pub fn clear_crashes(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> CrashStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> CrashStats {
        let records = self.load();
        let recent = self.recent(&records, now);
        CrashStats {
            total: records.len(),
            recent: recent.len(),
            oldest_recent: recent.iter().map(|r| r.timestamp).min(),
        }
    }

    fn recent<'a>(&self, records: &'a [CrashRecord], now: DateTime<Utc>) -> Vec<&'a CrashRecord> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        records
            .iter()
            .filter(|r| now.signed_duration_since(r.timestamp) <= window)
            .collect()
    }

    /// A missing or unreadable log counts as no crashes at all.
    fn load(&self) -> Vec<CrashRecord> {
        match self.read_log() {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("Ignoring unreadable crash log {:?}: {}", self.path, e);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// `None` when there is no log to read.
    fn read_log(&self) -> Option<Result<Vec<CrashRecord>, serde_json::Error>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        Some(serde_json::from_str(&raw))
    }

    /// `crashes.json.corrupt`, or a timestamped variant if that is taken.
    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".corrupt");
        let aside = PathBuf::from(name);
        if !aside.exists() {
            return aside;
        }
        let mut name = aside.into_os_string();
        name.push(format!(".{}", Utc::now().timestamp_millis()));
        PathBuf::from(name)
    }

    fn store(&self, records: &[CrashRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (value, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if value == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard(tmp: &TempDir) -> CrashGuard {
        CrashGuard::new(
            tmp.path().join("run").join("crashes.json"),
            3,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn missing_log_allows_restart() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        assert!(g.should_allow_restart().allowed);
        assert_eq!(g.stats().total, 0);
    }

    #[test]
    fn unparsable_log_counts_as_zero() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        std::fs::create_dir_all(g.path().parent().unwrap()).unwrap();
        std::fs::write(g.path(), "garbage{").unwrap();
        assert!(g.should_allow_restart().allowed);
    }

    #[test]
    fn recording_over_a_corrupt_log_keeps_the_old_bytes() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        std::fs::create_dir_all(g.path().parent().unwrap()).unwrap();
        std::fs::write(g.path(), "garbage{").unwrap();

        g.record_crash(Some("first after corruption")).unwrap();
        let aside = tmp.path().join("run").join("crashes.json.corrupt");
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "garbage{");
        assert_eq!(g.stats().total, 1);

        std::fs::write(g.path(), "still garbage").unwrap();
        g.record_crash(None).unwrap();
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "garbage{");
        let kept = std::fs::read_dir(tmp.path().join("run"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt"))
            .count();
        assert_eq!(kept, 2);
        assert_eq!(g.stats().total, 1);
    }

    #[test]
    fn vetoes_exactly_at_max_crashes() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        let now = Utc::now();

        g.record_crash_at(now - chrono::Duration::seconds(30), Some("boom"))
            .unwrap();
        g.record_crash_at(now - chrono::Duration::seconds(20), None)
            .unwrap();
        let decision = g.should_allow_restart_at(now);
        assert!(decision.allowed, "two of three crashes must still allow");
        assert!(decision.reason.is_none());

        g.record_crash_at(now - chrono::Duration::seconds(10), None)
            .unwrap();
        let decision = g.should_allow_restart_at(now);
        assert!(!decision.allowed);
        let reason = decision.reason.unwrap();
        assert!(reason.contains("3 crashes"), "reason was: {}", reason);
        assert!(reason.contains("5 minutes"), "reason was: {}", reason);
    }

    #[test]
    fn old_crashes_never_count() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        let now = Utc::now();
        for minutes in [10, 20, 30, 40] {
            g.record_crash_at(now - chrono::Duration::minutes(minutes), None)
                .unwrap();
        }
        assert!(g.should_allow_restart_at(now).allowed);

        let stats = g.stats_at(now);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.recent, 0);
        assert_eq!(stats.oldest_recent, None);
    }

    #[test]
    fn stats_report_oldest_recent_crash() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        let now = Utc::now();
        let older = now - chrono::Duration::seconds(200);
        g.record_crash_at(now - chrono::Duration::hours(2), None)
            .unwrap();
        g.record_crash_at(older, None).unwrap();
        g.record_crash_at(now - chrono::Duration::seconds(5), None)
            .unwrap();

        let stats = g.stats_at(now);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.recent, 2);
        assert_eq!(stats.oldest_recent, Some(older));
    }

    #[test]
    fn clear_removes_history_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let g = guard(&tmp);
        for _ in 0..3 {
            g.record_crash(Some("loop")).unwrap();
        }
        assert!(!g.should_allow_restart().allowed);

        g.clear_crashes().unwrap();
        g.clear_crashes().unwrap();
        assert!(g.should_allow_restart().allowed);
        assert_eq!(g.stats().total, 0);
    }

    #[test]
    fn human_duration_picks_largest_whole_unit() {
        assert_eq!(human_duration(Duration::from_secs(300)), "5 minutes");
        assert_eq!(human_duration(Duration::from_secs(3600)), "1 hour");
        assert_eq!(human_duration(Duration::from_secs(90)), "90 seconds");
        assert_eq!(human_duration(Duration::from_secs(1)), "1 second");
    }
}

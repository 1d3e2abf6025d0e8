use anyhow::{Result, anyhow};
use console::style;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::config::Config;
use crate::core::crash_guard::human_duration;
use crate::core::daemon::pid::read_pid;
use crate::core::daemon::{Daemon, StartupError, crash_guard_for, spawn_signal_listener};
use crate::core::paths::DataPaths;
use crate::core::queue::{DurableQueue, QueueName};
use crate::core::terminal::{GuideSection, print_error, print_info, print_warn};
use crate::platform::{NativePlatform, Platform};

/// Pid of a live daemon, if the marker points at one.
fn running_pid(paths: &DataPaths) -> Option<u32> {
    read_pid(&paths.pid_file()).filter(|pid| NativePlatform::is_process_alive(*pid))
}

pub async fn daemon_start(paths: &DataPaths) -> Result<()> {
    let run_dir = paths.run_dir();
    std::fs::create_dir_all(&run_dir)?;
    NativePlatform::restrict_dir_permissions(&run_dir);
    if let Some(pid) = running_pid(paths) {
        print_warn(&format!(
            "Daemon is already running (PID {}). Use 'chatrelay stop' first.",
            pid
        ));
        return Ok(());
    }
    if paths.config_file().exists() {
        NativePlatform::restrict_file_permissions(&paths.config_file());
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())?;

    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("daemon-run")
        .arg("--detached")
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    GuideSection::new("Daemon Started")
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("STARTING").green().bold(),
                style(child.id()).dim()
            ),
        )
        .status("Logs", &paths.log_file().display().to_string())
        .blank()
        .info(&format!(
            "Run {} to confirm it came up.",
            style("chatrelay status").cyan().bold()
        ))
        .print();
    println!();

    Ok(())
}

pub async fn daemon_stop(paths: &DataPaths) -> Result<()> {
    let Some(pid) = read_pid(&paths.pid_file()) else {
        print_info("Daemon is not currently running.");
        return Ok(());
    };
    if !NativePlatform::is_process_alive(pid) {
        std::fs::remove_file(paths.pid_file()).ok();
        print_info(&format!("Removed stale PID file (PID {} is gone).", pid));
        return Ok(());
    }

    NativePlatform::kill_process(&pid.to_string())?;
    // The daemon removes its own marker once drained.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while NativePlatform::is_process_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if NativePlatform::is_process_alive(pid) {
        print_warn(&format!("Daemon (PID {}) is still draining.", pid));
    } else {
        GuideSection::new("Daemon Stopped")
            .status(
                "Status",
                &format!(
                    "{} (was PID {})",
                    style("STOPPED").red().bold(),
                    style(pid).dim()
                ),
            )
            .print();
    }
    println!();
    Ok(())
}

pub async fn daemon_restart(paths: &DataPaths) -> Result<()> {
    daemon_stop(paths).await?;
    daemon_start(paths).await
}

pub async fn daemon_status(paths: &DataPaths) -> Result<()> {
    let mut section = GuideSection::new("Daemon Status");
    section = match running_pid(paths) {
        Some(pid) => section.status(
            "Daemon",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(pid).dim()
            ),
        ),
        None => section.status("Daemon", &style("STOPPED").red().bold().to_string()),
    };

    let config = match Config::load(&paths.config_file()).await {
        Ok(config) => config,
        Err(e) => {
            section.warn(&e.to_string()).print();
            println!();
            return Ok(());
        }
    };
    let paths = paths.clone().with_config(&config);
    let queue = DurableQueue::new(paths.queue_dir());
    let incoming = queue.pending(QueueName::Incoming).await.unwrap_or(0);
    let outgoing = queue.pending(QueueName::Outgoing).await.unwrap_or(0);
    section = section
        .status("Agents", &config.agents.len().to_string())
        .status(
            "Queue",
            &format!("{} incoming, {} outgoing", incoming, outgoing),
        );

    let guard = crash_guard_for(&config, &paths);
    let stats = guard.stats();
    section = section.status(
        "Crashes",
        &format!(
            "{} in the last {} ({} total, limit {})",
            stats.recent,
            human_duration(Duration::from_secs(config.crash_guard.window_secs)),
            stats.total,
            config.crash_guard.max_crashes
        ),
    );
    if !guard.should_allow_restart().allowed {
        section = section.blank().warn(&format!(
            "Crash guard is blocking startup. Run {} once the cause is fixed.",
            style("chatrelay crashes clear").cyan().bold()
        ));
    }
    section.print();
    println!();
    Ok(())
}

pub async fn follow_logs(paths: &DataPaths) -> Result<()> {
    let log_file = paths.log_file();
    if !log_file.exists() {
        print_error(&format!(
            "Log file not found at {}",
            style(log_file.display()).dim()
        ));
        return Ok(());
    }
    if running_pid(paths).is_none() {
        print_warn("Daemon is not running, showing the last lines only.");
    }
    GuideSection::new("Live Logs")
        .text(&format!(
            "Following {} - press {} to stop.",
            style("chatrelay.log").cyan(),
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
    let mut child = NativePlatform::tail_file(&log_file)?;
    let _ = child.wait()?;
    Ok(())
}

/// Foreground daemon. `detached` means stdout already goes to the log file.
pub async fn daemon_run(paths: &DataPaths, detached: bool) -> Result<()> {
    let level = Config::load(&paths.config_file())
        .await
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "info".to_string());
    let log_file = paths.log_file();
    crate::logging::init(&level, (!detached).then_some(log_file.as_path()))?;

    let daemon = match Daemon::startup(paths.clone()).await {
        Ok(daemon) => daemon,
        Err(e @ StartupError::CrashLoop(_)) => {
            error!("{}", e);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let guard = crash_guard_for(daemon.config(), daemon.paths());
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    // Own task so a panic unwinds through the daemon and drops its PID marker.
    let outcome = match tokio::spawn(daemon.run(shutdown)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("panic: {}", panic_message(e.into_panic()))),
        Err(e) => Err(anyhow!("daemon task was cancelled: {}", e)),
    };
    if let Err(e) = outcome {
        error!("Daemon failed: {:#}", e);
        if let Err(record_err) = guard.record_crash(Some(&format!("{:#}", e))) {
            error!("Could not record crash: {}", record_err);
        }
        return Err(e);
    }
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
    }
}

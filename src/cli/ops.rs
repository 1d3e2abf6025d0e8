use anyhow::{Result, bail};
use chrono::Utc;
use console::style;

use crate::core::config::Config;
use crate::core::crash_guard::human_duration;
use crate::core::daemon::crash_guard_for;
use crate::core::daemon::dispatch::CLI_CHANNEL;
use crate::core::paths::DataPaths;
use crate::core::queue::{DurableQueue, InboundMessage};
use crate::core::scheduler::{load_tasks, next_run_time};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

async fn load(paths: &DataPaths) -> Result<(Config, DataPaths)> {
    let config = Config::load(&paths.config_file()).await?;
    let paths = paths.clone().with_config(&config);
    Ok((config, paths))
}

pub async fn send_message(paths: &DataPaths, agent: Option<&str>, message: &str) -> Result<()> {
    if message.trim().is_empty() {
        bail!("--message is required");
    }
    let (config, paths) = load(paths).await?;
    if let Some(agent) = agent
        && config.agent(agent).is_none()
    {
        bail!("unknown agent '{}'", agent);
    }

    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    let mut msg = InboundMessage::new(CLI_CHANNEL, user.as_str(), user.as_str(), message);
    if let Some(agent) = agent {
        msg = msg.with_agent(agent);
    }
    let id = DurableQueue::new(paths.queue_dir()).write(&msg).await?;
    print_success(&format!("Queued message {}", style(id).dim()));
    Ok(())
}

pub async fn list_tasks(paths: &DataPaths) -> Result<()> {
    let (_, paths) = load(paths).await?;
    let loaded = load_tasks(paths.tasks_dir()).await?;
    let now = Utc::now();

    let mut section = GuideSection::new("Scheduled Tasks");
    if loaded.tasks.is_empty() {
        section = section.info(&format!(
            "No tasks in {}",
            style(paths.tasks_dir().display()).dim()
        ));
    }
    for task in &loaded.tasks {
        let next = match next_run_time(&task.schedule, now, task.tz()) {
            Ok(next) => next
                .with_timezone(&task.tz())
                .format("%Y-%m-%d %H:%M %Z")
                .to_string(),
            Err(e) => format!("invalid schedule: {}", e),
        };
        let state = if task.enabled {
            style("enabled").green()
        } else {
            style("disabled").dim()
        };
        section = section.status(
            &task.name,
            &format!(
                "{} [{}] {} next: {}",
                task.schedule,
                task.action.kind(),
                state,
                next
            ),
        );
    }
    if loaded.error_count > 0 {
        section = section.blank().warn(&format!(
            "{} task file(s) could not be loaded, see the daemon log.",
            loaded.error_count
        ));
    }
    section.print();
    println!();
    Ok(())
}

pub async fn crashes(paths: &DataPaths, clear: bool) -> Result<()> {
    let (config, paths) = load(paths).await?;
    let guard = crash_guard_for(&config, &paths);
    if clear {
        guard.clear_crashes()?;
        print_success("Crash history cleared.");
        return Ok(());
    }

    let stats = guard.stats();
    let decision = guard.should_allow_restart();
    let mut section = GuideSection::new("Crash Guard")
        .status("Recorded", &stats.total.to_string())
        .status(
            "Recent",
            &format!(
                "{} in the last {} (limit {})",
                stats.recent,
                human_duration(std::time::Duration::from_secs(
                    config.crash_guard.window_secs
                )),
                config.crash_guard.max_crashes
            ),
        );
    if let Some(oldest) = stats.oldest_recent {
        section = section.status("Oldest recent", &oldest.to_rfc3339());
    }
    section = match decision.reason {
        Some(reason) => section.blank().warn(&reason),
        None => section.blank().info("Restarts are allowed."),
    };
    section.print();
    println!();
    Ok(())
}

pub async fn reset_agent(paths: &DataPaths, agent: &str) -> Result<()> {
    let (config, paths) = load(paths).await?;
    if config.agent(agent).is_none() {
        bail!("unknown agent '{}'", agent);
    }
    let signal = paths.reset_signal(agent);
    if signal.exists() {
        print_warn(&format!("A reset for '{}' is already pending.", agent));
        return Ok(());
    }
    tokio::fs::create_dir_all(paths.reset_dir()).await?;
    tokio::fs::write(&signal, Utc::now().to_rfc3339()).await?;
    print_info(&format!(
        "'{}' will start a fresh session on its next message.",
        agent
    ));
    Ok(())
}

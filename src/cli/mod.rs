mod daemon;
mod ops;

use anyhow::Result;
use console::style;

use crate::core::paths::DataPaths;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("start", "Start the relay daemon in the background")
        .command("stop", "Stop the daemon and wait for it to drain")
        .command("restart", "Stop, then start the daemon")
        .command("status", "Show daemon, queue and crash guard state")
        .command("logs", "Follow real-time daemon logs")
        .command("daemon-run", "Run the daemon in the foreground")
        .print();

    GuideSection::new("Messages & Tasks")
        .command("send", "Queue a message: --agent <id> --message <text>")
        .command("tasks", "List scheduled tasks and their next run")
        .command("reset <agent>", "Start a fresh session on the agent's next message")
        .print();

    GuideSection::new("Diagnostics")
        .command("crashes", "Show recent crashes")
        .command("crashes clear", "Forget recorded crashes so the daemon may start")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style(NativePlatform::binary_name()).green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Stop,
    Restart,
    Status,
    Logs,
    DaemonRun { detached: bool },
    Send { agent: Option<String>, message: String },
    Tasks,
    Crashes { clear: bool },
    Reset { agent: String },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SendArgs {
    pub agent: Option<String>,
    pub message: String,
}

pub(crate) fn parse_send_args(args: &[String], start: usize) -> SendArgs {
    let mut agent = None;
    let mut message = String::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--agent" | "-a" => {
                if i + 1 < args.len() {
                    agent = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    message = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    SendArgs { agent, message }
}

pub(crate) fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.get(1) else {
        return Ok(Command::Help);
    };
    let sub = args.get(2).map(String::as_str);
    match cmd.as_str() {
        "start" => Ok(Command::Start),
        "stop" => Ok(Command::Stop),
        "restart" => Ok(Command::Restart),
        "status" => Ok(Command::Status),
        "logs" => Ok(Command::Logs),
        "daemon-run" => Ok(Command::DaemonRun {
            detached: args[2..].iter().any(|a| a == "--detached"),
        }),
        "send" => {
            let parsed = parse_send_args(args, 2);
            if parsed.message.trim().is_empty() {
                return Err("--message is required for send.".to_string());
            }
            Ok(Command::Send {
                agent: parsed.agent,
                message: parsed.message,
            })
        }
        "tasks" => Ok(Command::Tasks),
        "crashes" => match sub {
            None => Ok(Command::Crashes { clear: false }),
            Some("clear") => Ok(Command::Crashes { clear: true }),
            Some(other) => Err(format!("Unknown crashes command: {}", other)),
        },
        "reset" => match sub {
            Some(agent) if !agent.starts_with('-') => Ok(Command::Reset {
                agent: agent.to_string(),
            }),
            _ => Err("reset needs an agent id.".to_string()),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("Unknown command: {}", other)),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(msg) => {
            print_error(&msg);
            print_help();
            return Ok(());
        }
    };

    let paths = DataPaths::from_env();
    match command {
        Command::Start => daemon::daemon_start(&paths).await,
        Command::Stop => daemon::daemon_stop(&paths).await,
        Command::Restart => daemon::daemon_restart(&paths).await,
        Command::Status => daemon::daemon_status(&paths).await,
        Command::Logs => daemon::follow_logs(&paths).await,
        Command::DaemonRun { detached } => daemon::daemon_run(&paths, detached).await,
        Command::Send { agent, message } => {
            ops::send_message(&paths, agent.as_deref(), &message).await
        }
        Command::Tasks => ops::list_tasks(&paths).await,
        Command::Crashes { clear } => ops::crashes(&paths, clear).await,
        Command::Reset { agent } => ops::reset_agent(&paths, &agent).await,
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, parse_command, parse_send_args};

    fn argv(parts: &[&str]) -> Vec<String> {
        std::iter::once("chatrelay")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_send_args_reads_agent_and_message() {
        let parsed = parse_send_args(&argv(&["send", "-a", "coder", "--message", "hi"]), 2);
        assert_eq!(parsed.agent.as_deref(), Some("coder"));
        assert_eq!(parsed.message, "hi");
    }

    #[test]
    fn send_without_message_is_rejected() {
        assert!(parse_command(&argv(&["send", "--agent", "coder"])).is_err());
    }

    #[test]
    fn no_arguments_shows_help() {
        assert_eq!(parse_command(&argv(&[])), Ok(Command::Help));
    }

    #[test]
    fn daemon_run_detached_flag() {
        assert_eq!(
            parse_command(&argv(&["daemon-run", "--detached"])),
            Ok(Command::DaemonRun { detached: true })
        );
        assert_eq!(
            parse_command(&argv(&["daemon-run"])),
            Ok(Command::DaemonRun { detached: false })
        );
    }

    #[test]
    fn crashes_and_reset_subcommands() {
        assert_eq!(
            parse_command(&argv(&["crashes", "clear"])),
            Ok(Command::Crashes { clear: true })
        );
        assert!(parse_command(&argv(&["crashes", "purge"])).is_err());
        assert_eq!(
            parse_command(&argv(&["reset", "assistant"])),
            Ok(Command::Reset {
                agent: "assistant".into()
            })
        );
        assert!(parse_command(&argv(&["reset"])).is_err());
    }
}

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

use super::task::{ReplyTo, Task, TaskAction};
use crate::core::config::Config;
use crate::core::heartbeat;
use crate::core::queue::{DurableQueue, InboundMessage, OutboundMessage};
use crate::platform::{NativePlatform, Platform};

pub const SCHEDULER_CHANNEL: &str = "scheduler";

/// Everything an action needs besides the task itself.
#[derive(Clone)]
pub struct ActionContext {
    pub queue: DurableQueue,
    pub config: Arc<Config>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed { detail: String },
    Failed { error: String },
    Skipped { reason: String },
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Completed { detail } => write!(f, "completed: {}", detail),
            ActionOutcome::Failed { error } => write!(f, "failed: {}", error),
            ActionOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

fn failed(error: impl fmt::Display) -> ActionOutcome {
    ActionOutcome::Failed {
        error: error.to_string(),
    }
}

/// Runs the gating condition, then the action. Message and heartbeat
/// actions only enqueue; the daemon delivers them to the agent.
pub async fn run_action(task: &Task, ctx: &ActionContext) -> ActionOutcome {
    let cwd = match &task.action {
        TaskAction::Command { cwd, .. } => cwd.as_deref(),
        _ => None,
    };

    if let Some(condition) = &task.condition {
        match condition_passes(condition, cwd).await {
            Ok(true) => {}
            Ok(false) => {
                return ActionOutcome::Skipped {
                    reason: format!("condition `{}` not met", condition),
                };
            }
            Err(e) => return failed(format!("condition `{}` could not run: {}", condition, e)),
        }
    }

    match &task.action {
        TaskAction::Message { agent, message } => {
            let inbound = synthetic_inbound(task, agent, message.clone());
            enqueue(ctx, inbound).await
        }
        TaskAction::Heartbeat { agent } => {
            let path = ctx.config.agent(agent).and_then(|a| a.heartbeat_prompt_path());
            let prompt = heartbeat::read_prompt(path.as_deref()).await;
            let mut inbound = synthetic_inbound(task, agent, prompt);
            if task.reply_to.is_none() {
                inbound.channel = heartbeat::HEARTBEAT_CHANNEL.to_string();
            }
            enqueue(ctx, inbound).await
        }
        TaskAction::Command { command, cwd } => {
            run_command(task, ctx, command, cwd.as_deref()).await
        }
    }
}

async fn condition_passes(condition: &str, cwd: Option<&Path>) -> std::io::Result<bool> {
    let mut cmd = NativePlatform::shell_inline(condition);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    Ok(cmd.status().await?.success())
}

/// Inbound message standing in for a user. With `replyTo` it looks like it
/// came from that chat, so the answer is delivered there.
fn synthetic_inbound(task: &Task, agent: &str, text: String) -> InboundMessage {
    match &task.reply_to {
        Some(ReplyTo {
            channel,
            destination,
            ..
        }) => {
            let mut msg = InboundMessage::new(
                channel.as_str(),
                task.name.as_str(),
                destination.as_str(),
                text,
            )
            .with_agent(agent);
            msg.session = Some(destination.clone());
            msg
        }
        None => InboundMessage::new(SCHEDULER_CHANNEL, task.name.as_str(), SCHEDULER_CHANNEL, text)
            .with_agent(agent),
    }
}

async fn enqueue(ctx: &ActionContext, inbound: InboundMessage) -> ActionOutcome {
    let agent = inbound.agent.clone().unwrap_or_default();
    match ctx.queue.write(&inbound).await {
        Ok(id) => ActionOutcome::Completed {
            detail: format!("queued message {} for agent {}", id, agent),
        },
        Err(e) => failed(e),
    }
}

async fn run_command(
    task: &Task,
    ctx: &ActionContext,
    command: &str,
    cwd: Option<&Path>,
) -> ActionOutcome {
    info!("[scheduler] Task '{}' running `{}`", task.name, command);
    let mut cmd = NativePlatform::shell_inline(command);
    cmd.stdin(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) => return failed(format!("failed to spawn `{}`: {}", command, e)),
    };

    let code = output.status.code().unwrap_or(-1);
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }

    if let Some(reply) = &task.reply_to {
        let body = match (output.status.success(), text.is_empty()) {
            (true, true) => format!("Task '{}' finished with no output.", task.name),
            (true, false) => text.clone(),
            (false, _) => format!("Task '{}' failed (exit {}):\n{}", task.name, code, text),
        };
        let mut outbound =
            OutboundMessage::new(reply.channel.as_str(), reply.destination.as_str(), body);
        outbound.agent = reply.agent.clone();
        if let Err(e) = ctx.queue.write(&outbound).await {
            warn!("[scheduler] Could not queue output of '{}': {}", task.name, e);
        }
    }

    if output.status.success() {
        ActionOutcome::Completed {
            detail: format!("exit 0, {} bytes of output", text.len()),
        }
    } else {
        failed(format!("exit {}: {}", code, text))
    }
}

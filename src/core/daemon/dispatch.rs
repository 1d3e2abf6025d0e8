//! Routing of one inbound message to its agent and back to the user.

use anyhow::{Result, anyhow};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::agent::{AgentRequest, AgentRunner};
use crate::core::cache::TtlCache;
use crate::core::config::{AgentConfig, Config};
use crate::core::heartbeat::HEARTBEAT_CHANNEL;
use crate::core::queue::{DurableQueue, InboundMessage, OutboundMessage};
use crate::core::scheduler::SCHEDULER_CHANNEL;
use crate::interfaces::streaming::{EMPTY_RESPONSE, StreamingReply};
use crate::interfaces::{Channel, ChannelRegistry};

/// Messages queued with `chatrelay send`.
pub const CLI_CHANNEL: &str = "cli";

/// Channels that have no chat to answer in; replies are only logged.
pub const INTERNAL_CHANNELS: [&str; 3] = [HEARTBEAT_CHANNEL, SCHEDULER_CHANNEL, CLI_CHANNEL];

pub const FAILURE_NOTICE: &str = "Sorry, the agent failed to answer this message. Check the daemon logs.";

const TYPING_REFRESH: Duration = Duration::from_secs(4);

pub type ChatKey = (String, String);

pub struct DispatchContext {
    pub config: Arc<Config>,
    pub queue: DurableQueue,
    pub runner: Arc<dyn AgentRunner>,
    pub channels: ChannelRegistry,
    pub reset_dir: PathBuf,
    pub stream_throttle: Duration,
    /// `(channel, messageId)` pairs seen recently.
    pub dedupe: Arc<TtlCache<ChatKey, ()>>,
    /// `(channel, destination)` pairs with a running typing indicator.
    pub typing: Arc<TtlCache<ChatKey, ()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Duplicate,
    NoAgent,
    UnknownAgent(String),
    Streamed { agent: String },
    Queued { agent: String, id: String },
    Logged { agent: String },
}

pub fn is_internal(channel: &str) -> bool {
    INTERNAL_CHANNELS.contains(&channel)
}

/// Pick the agent for a message: a leading `@agent_id` naming a configured
/// agent wins, then the message's `agent` field, then the default agent.
/// Returns the agent id and the text with any routing prefix removed.
pub fn resolve_agent(config: &Config, msg: &InboundMessage) -> (Option<String>, String) {
    let text = msg.message.trim_start();
    if let Some(rest) = text.strip_prefix('@') {
        let (name, body) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));
        if config.agent(name).is_some() {
            return (Some(name.to_string()), body.trim_start().to_string());
        }
    }
    let agent = msg
        .agent
        .clone()
        .or_else(|| config.default_agent_id().map(str::to_string));
    (agent, msg.message.clone())
}

fn build_prompt(text: &str, msg: &InboundMessage) -> String {
    let mut prompt = text.trim().to_string();
    for a in msg.attachments.iter().flatten() {
        if !prompt.is_empty() {
            prompt.push('\n');
        }
        match &a.mime_type {
            Some(mime) => prompt.push_str(&format!(
                "[{} attached: {} ({})]",
                a.kind.as_str(),
                a.file_id,
                mime
            )),
            None => prompt.push_str(&format!("[{} attached: {}]", a.kind.as_str(), a.file_id)),
        }
    }
    prompt
}

/// Where replies to this message go: the chat it came from.
pub fn reply_destination(msg: &InboundMessage) -> String {
    msg.session
        .clone()
        .unwrap_or_else(|| msg.sender_id.to_string())
}

impl DispatchContext {
    /// Consume the agent's reset signal. Returns whether one was present.
    async fn take_reset(&self, agent_id: &str) -> bool {
        let path = self.reset_dir.join(agent_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("[{}] Reset requested, starting a fresh session", agent_id);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("[{}] Could not consume reset signal {:?}: {}", agent_id, path, e);
                false
            }
        }
    }

    /// Refresh the typing indicator until `until` resolves. Only one
    /// indicator runs per chat.
    async fn start_typing<F>(
        &self,
        client: Arc<dyn Channel>,
        channel: &str,
        destination: &str,
        until: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Future + Send + 'static,
    {
        let key = (channel.to_string(), destination.to_string());
        if !self.typing.insert_if_absent(key.clone(), ()).await {
            return None;
        }
        let typing = self.typing.clone();
        let destination = destination.to_string();
        Some(tokio::spawn(async move {
            tokio::pin!(until);
            loop {
                if let Err(e) = client.send_typing(&destination).await {
                    debug!("Typing indicator for {} failed: {}", destination, e);
                }
                tokio::select! {
                    _ = &mut until => break,
                    _ = tokio::time::sleep(TYPING_REFRESH) => {}
                }
            }
            typing.remove(&key).await;
        }))
    }

    pub async fn dispatch(&self, msg: InboundMessage) -> Result<DispatchOutcome> {
        let dedupe_key = (msg.channel.clone(), msg.message_id.clone());
        if !self.dedupe.insert_if_absent(dedupe_key, ()).await {
            debug!(
                "Dropping duplicate {} message {}",
                msg.channel, msg.message_id
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        let (agent_id, text) = resolve_agent(&self.config, &msg);
        let Some(agent_id) = agent_id else {
            warn!(
                "No agent configured for {} message from {}, dropping",
                msg.channel, msg.sender
            );
            return Ok(DispatchOutcome::NoAgent);
        };
        let Some(agent) = self.config.agent(&agent_id) else {
            warn!(
                "Unknown agent '{}' for {} message from {}, dropping",
                agent_id, msg.channel, msg.sender
            );
            return Ok(DispatchOutcome::UnknownAgent(agent_id));
        };

        let fresh = self.take_reset(&agent.id).await;
        let request = AgentRequest::for_agent(agent, build_prompt(&text, &msg), fresh);
        info!(
            "[{}] Dispatching {} message {} from {}",
            agent.id, msg.channel, msg.message_id, msg.sender
        );

        if is_internal(&msg.channel) {
            let response = self.runner.run(&request).await?;
            info!(
                "[{}] Response to {} message: {}",
                agent.id,
                msg.channel,
                preview(&response)
            );
            return Ok(DispatchOutcome::Logged {
                agent: agent.id.clone(),
            });
        }

        let client = self.channels.client_for(&agent.id, &msg.channel);
        match client {
            Some(client) if agent.streaming => self.stream(agent, client, &msg, request).await,
            client => self.respond_via_queue(agent, client, &msg, request).await,
        }
    }

    async fn stream(
        &self,
        agent: &AgentConfig,
        client: Arc<dyn Channel>,
        msg: &InboundMessage,
        request: AgentRequest,
    ) -> Result<DispatchOutcome> {
        let destination = reply_destination(msg);
        let (tx, rx) = mpsc::channel(64);
        let run = self.runner.run_streaming(request, tx)?;

        let typing = self
            .start_typing(client.clone(), &msg.channel, &destination, run.started)
            .await;

        let mut reply = StreamingReply::new(client, destination, self.stream_throttle);
        reply.consume(rx).await;
        let result = run
            .done
            .await
            .map_err(|e| anyhow!("agent task failed: {}", e))
            .and_then(|r| r);
        if let Some(typing) = typing {
            let _ = typing.await;
        }

        match result {
            Ok(text) => {
                if let Err(e) = reply.finish(&text).await {
                    error!("[{}] Final streamed reply failed: {}", agent.id, e);
                }
                Ok(DispatchOutcome::Streamed {
                    agent: agent.id.clone(),
                })
            }
            Err(e) => {
                if let Err(send_err) = reply.fail(FAILURE_NOTICE).await {
                    error!("[{}] Failed to report error: {}", agent.id, send_err);
                }
                Err(e)
            }
        }
    }

    async fn respond_via_queue(
        &self,
        agent: &AgentConfig,
        client: Option<Arc<dyn Channel>>,
        msg: &InboundMessage,
        request: AgentRequest,
    ) -> Result<DispatchOutcome> {
        let destination = reply_destination(msg);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let typing = match &client {
            Some(client) => {
                self.start_typing(client.clone(), &msg.channel, &destination, done_rx)
                    .await
            }
            None => None,
        };

        let result = self.runner.run(&request).await;
        let _ = done_tx.send(());
        if let Some(typing) = typing {
            let _ = typing.await;
        }

        let (text, failure) = match result {
            Ok(text) if text.trim().is_empty() => (EMPTY_RESPONSE.to_string(), None),
            Ok(text) => (text, None),
            Err(e) => (FAILURE_NOTICE.to_string(), Some(e)),
        };

        let mut outbound = OutboundMessage::new(msg.channel.as_str(), destination, text);
        // Unaddressed messages go out through whichever bot serves this channel.
        outbound.agent = client.as_ref().map(|_| agent.id.clone());
        let id = self.queue.write(&outbound).await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(DispatchOutcome::Queued {
                agent: agent.id.clone(),
                id,
            }),
        }
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    let text = text.trim();
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX).collect();
    format!("{}...", cut)
}

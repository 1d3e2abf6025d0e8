//! Chat channel adapters.
//!
//! Every agent with a configured channel gets two pieces: a [`Channel`]
//! client used to send, edit and delete messages, and a [`ChannelListener`]
//! that turns platform events into inbound queue entries. Listeners run
//! under a [`ChannelSupervisor`] which restarts them with backoff.

pub mod discord;
pub mod outbound;
pub mod streaming;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::{AgentConfig, ChannelKind, Config};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::queue::{DurableQueue, OutboundMessage};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("cannot read attachment {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("channel API error: {0}")]
    Api(String),
}

impl ChannelError {
    /// Errors that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidDestination(_)
                | ChannelError::MessageNotFound(_)
                | ChannelError::File { .. }
        )
    }
}

/// A message that was sent and can later be edited or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub destination: String,
    pub message_id: String,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Longest text the platform accepts in one message, in characters.
    fn max_message_len(&self) -> usize;

    async fn send_message(&self, destination: &str, text: &str) -> Result<MessageRef, ChannelError>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError>;

    async fn delete_message(&self, message: &MessageRef) -> Result<(), ChannelError>;

    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef, ChannelError>;

    async fn send_typing(&self, destination: &str) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Receive events until `shutdown` fires. Returning early, with or
    /// without an error, means the connection dropped.
    async fn listen(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Split text into pieces of at most `max_chars` characters, preferring
/// line breaks, then spaces, as cut points.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let hard = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard);
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Whether `sender` may talk to an agent. An empty allow-list admits everyone.
pub fn sender_allowed(allowed: &HashSet<String>, ids: &[&str]) -> bool {
    allowed.is_empty() || ids.iter().any(|id| allowed.contains(*id))
}

/// Channel clients keyed by the agent that owns them.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    clients: HashMap<String, Arc<dyn Channel>>,
    /// Per kind, the agent whose client also delivers unaddressed outbound messages.
    default_sender: HashMap<ChannelKind, String>,
}

impl ChannelRegistry {
    pub fn insert(&mut self, agent_id: &str, client: Arc<dyn Channel>) {
        self.default_sender
            .entry(client.kind())
            .or_insert_with(|| agent_id.to_string());
        self.clients.insert(agent_id.to_string(), client);
    }

    /// The agent's client, if it speaks the named channel.
    pub fn client_for(&self, agent_id: &str, channel: &str) -> Option<Arc<dyn Channel>> {
        let kind = ChannelKind::parse(channel)?;
        self.clients
            .get(agent_id)
            .filter(|c| c.kind() == kind)
            .cloned()
    }

    pub fn is_default_sender(&self, agent_id: &str, kind: ChannelKind) -> bool {
        self.default_sender.get(&kind).is_some_and(|a| a == agent_id)
    }

    /// Whether some registered client would claim `msg` from the outgoing queue.
    pub fn can_deliver(&self, msg: &OutboundMessage) -> bool {
        let Some(kind) = ChannelKind::parse(&msg.channel) else {
            return false;
        };
        match &msg.agent {
            Some(agent) => self.clients.get(agent).is_some_and(|c| c.kind() == kind),
            None => self.default_sender.contains_key(&kind),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Channel>)> {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// A listener that stayed up this long resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(120);

/// Keeps one listener running until shut down.
pub struct ChannelSupervisor {
    name: String,
    listener: Arc<dyn ChannelListener>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl ChannelSupervisor {
    pub fn new(name: impl Into<String>, listener: Arc<dyn ChannelListener>) -> Self {
        Self {
            name: name.into(),
            listener,
            shutdown: CancellationToken::new(),
            handle: None,
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn spawn(&mut self) {
        if self.is_running() {
            return;
        }
        let name = self.name.clone();
        let listener = self.listener.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            supervise(name, listener, shutdown).await
        }));
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(self.stop_grace, handle).await.is_err() {
            warn!("[{}] Listener did not stop in time, aborting", self.name);
            abort.abort();
        }
    }
}

async fn supervise(name: String, listener: Arc<dyn ChannelListener>, shutdown: CancellationToken) {
    let mut backoff = BACKOFF_START;
    loop {
        let started = tokio::time::Instant::now();
        info!("[{}] Channel listener starting", name);
        match listener.listen(shutdown.clone()).await {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => warn!("[{}] Channel listener stopped unexpectedly", name),
            Err(e) => error!("[{}] Channel listener failed: {}", name, e),
        }
        if shutdown.is_cancelled() {
            break;
        }
        if started.elapsed() >= HEALTHY_RUN {
            backoff = BACKOFF_START;
        }
        info!("[{}] Restarting channel listener in {:?}", name, backoff);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
    info!("[{}] Channel listener stopped", name);
}

#[async_trait]
impl LifecycleComponent for ChannelSupervisor {
    async fn on_init(&mut self) -> Result<()> {
        info!("[{}] Channel interface initializing...", self.name);
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.spawn();
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("[{}] Channel interface shutting down...", self.name);
        self.stop().await;
        Ok(())
    }
}

/// A configured agent's channel, ready to be supervised.
pub struct ChannelSetup {
    pub agent_id: String,
    pub client: Arc<dyn Channel>,
    pub listener: Arc<dyn ChannelListener>,
}

fn setup_for(agent: &AgentConfig, queue: &DurableQueue) -> Result<Option<ChannelSetup>> {
    let Some(channel) = &agent.channel else {
        return Ok(None);
    };
    let allowed: HashSet<String> = channel.allowed_senders.iter().cloned().collect();
    let (client, listener): (Arc<dyn Channel>, Arc<dyn ChannelListener>) = match channel.kind {
        ChannelKind::Telegram => {
            let bot = telegram::bot(&channel.token);
            (
                Arc::new(telegram::TelegramChannel::new(bot.clone())),
                Arc::new(telegram::TelegramListener::new(
                    agent.id.clone(),
                    bot,
                    queue.clone(),
                    allowed,
                )),
            )
        }
        ChannelKind::Discord => (
            Arc::new(discord::DiscordChannel::new(&channel.token)),
            Arc::new(discord::DiscordListener::new(
                agent.id.clone(),
                channel.token.clone(),
                queue.clone(),
                allowed,
            )),
        ),
    };
    Ok(Some(ChannelSetup {
        agent_id: agent.id.clone(),
        client,
        listener,
    }))
}

/// Build a client and listener for every agent that has a channel.
pub fn build_channels(config: &Config, queue: &DurableQueue) -> Result<Vec<ChannelSetup>> {
    let mut setups = Vec::new();
    for agent in &config.agents {
        if let Some(setup) = setup_for(agent, queue)? {
            info!(
                "[{}] {} channel configured",
                agent.id,
                setup.client.kind().as_str()
            );
            setups.push(setup);
        }
    }
    Ok(setups)
}


#[cfg(test)]
mod tests {
    use super::testing::MockChannel;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn chunking_prefers_line_breaks() {
        let text = "first line\nsecond line\nthird";
        assert_eq!(
            chunk_message(text, 15),
            vec!["first line", "second line", "third"]
        );
        assert_eq!(chunk_message("short", 100), vec!["short"]);
        assert_eq!(chunk_message("", 10), vec![""]);
    }

    #[test]
    fn chunking_hard_splits_long_words_on_char_boundaries() {
        let chunks = chunk_message("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn registry_knows_which_outbound_messages_it_can_deliver() {
        let mut registry = ChannelRegistry::default();
        registry.insert("assistant", MockChannel::new(ChannelKind::Telegram, 4096));

        let unaddressed = OutboundMessage::new("telegram", "1", "hi");
        assert!(registry.can_deliver(&unaddressed));
        let mut own = unaddressed.clone();
        own.agent = Some("assistant".into());
        assert!(registry.can_deliver(&own));

        let mut stranger = unaddressed.clone();
        stranger.agent = Some("coder".into());
        assert!(!registry.can_deliver(&stranger));
        assert!(!registry.can_deliver(&OutboundMessage::new("discord", "1", "hi")));
        assert!(!registry.can_deliver(&OutboundMessage::new("slack", "1", "hi")));
    }

    #[test]
    fn allow_list() {
        let empty = HashSet::new();
        assert!(sender_allowed(&empty, &["1"]));
        let allowed: HashSet<String> = ["42".to_string(), "alice".to_string()].into();
        assert!(sender_allowed(&allowed, &["7", "alice"]));
        assert!(!sender_allowed(&allowed, &["7", "bob"]));
    }

    #[test]
    fn registry_matches_channel_kind() {
        let mut registry = ChannelRegistry::default();
        registry.insert("a", MockChannel::new(ChannelKind::Telegram, 4096));
        registry.insert("b", MockChannel::new(ChannelKind::Telegram, 4096));
        registry.insert("c", MockChannel::new(ChannelKind::Discord, 2000));

        assert!(registry.client_for("a", "telegram").is_some());
        assert!(registry.client_for("a", "discord").is_none());
        assert!(registry.client_for("a", "heartbeat").is_none());
        assert!(registry.is_default_sender("a", ChannelKind::Telegram));
        assert!(!registry.is_default_sender("b", ChannelKind::Telegram));
        assert!(registry.is_default_sender("c", ChannelKind::Discord));
    }

    struct FlakyListener {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ChannelListener for FlakyListener {
        async fn listen(&self, shutdown: CancellationToken) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < 2 {
                anyhow::bail!("connection reset");
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_failed_listener_then_stops() {
        let listener = Arc::new(FlakyListener {
            runs: AtomicUsize::new(0),
        });
        let mut supervisor = ChannelSupervisor::new("test", listener.clone());
        supervisor.spawn();

        // Two failures: backoff 1s then 2s before the third, healthy run.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(listener.runs.load(Ordering::SeqCst), 3);
        assert!(supervisor.is_running());

        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }
}

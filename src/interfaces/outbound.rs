//! Per-client delivery loop for the outgoing queue.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Channel, ChannelError, ChannelRegistry, chunk_message};
use crate::core::cache::TtlCache;
use crate::core::queue::{DurableQueue, OutboundMessage, QueueError, QueueName, QueuedMessage};

/// Transient failures tolerated before a message is dropped as undeliverable.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Idle,
    Delivered(String),
    Retrying { id: String, attempts: u32 },
    Dropped(String),
}

pub struct OutboundSender {
    agent_id: String,
    channel: Arc<dyn Channel>,
    queue: DurableQueue,
    /// Whether this client also delivers messages without an `agent`.
    claims_unaddressed: bool,
    attempts: Arc<TtlCache<String, u32>>,
}

impl OutboundSender {
    pub fn new(
        agent_id: impl Into<String>,
        channel: Arc<dyn Channel>,
        queue: DurableQueue,
        claims_unaddressed: bool,
        attempts: Arc<TtlCache<String, u32>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel,
            queue,
            claims_unaddressed,
            attempts,
        }
    }

    fn accepts(&self, msg: &OutboundMessage) -> bool {
        if msg.channel != self.channel.kind().as_str() {
            return false;
        }
        match &msg.agent {
            Some(agent) => agent == &self.agent_id,
            None => self.claims_unaddressed,
        }
    }

    pub async fn run(self, poll: Duration, shutdown: CancellationToken) {
        info!(
            "[{}] Outbound sender for {} started",
            self.agent_id,
            self.channel.kind().as_str()
        );
        loop {
            let delivery = match self.deliver_next().await {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!("[{}] Outbound queue read failed: {}", self.agent_id, e);
                    Delivery::Idle
                }
            };
            // Keep draining while there is work and the last attempt succeeded.
            if matches!(delivery, Delivery::Delivered(_) | Delivery::Dropped(_))
                && !shutdown.is_cancelled()
            {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
        debug!("[{}] Outbound sender stopped", self.agent_id);
    }

    /// Claim and deliver the oldest message meant for this client.
    pub async fn deliver_next(&self) -> Result<Delivery, QueueError> {
        let Some(QueuedMessage { id, payload, .. }) = self
            .queue
            .read_oldest_where(|m: &OutboundMessage| self.accepts(m))
            .await?
        else {
            return Ok(Delivery::Idle);
        };

        match self.send(&payload).await {
            Ok(()) => {
                self.queue.delete(QueueName::Outgoing, &id).await?;
                self.attempts.remove(&id).await;
                debug!("[{}] Delivered outbound {}", self.agent_id, id);
                Ok(Delivery::Delivered(id))
            }
            Err(e) if e.is_permanent() => {
                error!(
                    "[{}] Dropping undeliverable outbound {} to {}: {}",
                    self.agent_id, id, payload.destination, e
                );
                self.queue.delete(QueueName::Outgoing, &id).await?;
                self.attempts.remove(&id).await;
                Ok(Delivery::Dropped(id))
            }
            Err(e) => {
                let attempts = self.attempts.get(&id).await.unwrap_or(0) + 1;
                if attempts >= MAX_DELIVERY_ATTEMPTS {
                    error!(
                        "[{}] Giving up on outbound {} after {} attempts: {}",
                        self.agent_id, id, attempts, e
                    );
                    self.queue.delete(QueueName::Outgoing, &id).await?;
                    self.attempts.remove(&id).await;
                    return Ok(Delivery::Dropped(id));
                }
                warn!(
                    "[{}] Outbound {} failed (attempt {}): {}",
                    self.agent_id, id, attempts, e
                );
                self.attempts.insert(id.clone(), attempts).await;
                Ok(Delivery::Retrying { id, attempts })
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !msg.message.trim().is_empty() {
            for piece in chunk_message(msg.message.trim(), self.channel.max_message_len()) {
                self.channel.send_message(&msg.destination, &piece).await?;
            }
        }
        for file in msg.files.iter().flatten() {
            self.channel
                .send_file(&msg.destination, Path::new(&file.path), file.caption.as_deref())
                .await?;
        }
        Ok(())
    }
}

/// Move outgoing messages that no registered client would ever claim into
/// `errors/`. Returns how many were set aside.
pub async fn set_aside_unroutable(
    queue: &DurableQueue,
    registry: &ChannelRegistry,
) -> Result<usize, QueueError> {
    let mut seen = HashSet::new();
    while let Some(msg) = queue
        .read_oldest_where(|m: &OutboundMessage| !registry.can_deliver(m))
        .await?
    {
        // A failed move leaves the file in place; stop rather than spin on it.
        if !seen.insert(msg.id.clone()) {
            break;
        }
        warn!(
            "Setting aside outbound {} for {} ({}): no client can deliver it",
            msg.id,
            msg.payload.channel,
            msg.payload.agent.as_deref().unwrap_or("any agent")
        );
        queue.set_aside(&msg).await;
    }
    Ok(seen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ChannelKind;
    use crate::core::queue::OutboundFile;
    use crate::interfaces::testing::{MockChannel, Op};
    use tempfile::TempDir;

    fn sender(tmp: &TempDir, channel: &Arc<MockChannel>, claims: bool) -> OutboundSender {
        OutboundSender::new(
            "assistant",
            channel.clone(),
            DurableQueue::new(tmp.path()),
            claims,
            Arc::new(TtlCache::new(Duration::from_secs(3600), 64)),
        )
    }

    #[tokio::test]
    async fn delivers_text_and_files_then_deletes() {
        let tmp = TempDir::new().unwrap();
        let channel = MockChannel::new(ChannelKind::Telegram, 4096);
        let s = sender(&tmp, &channel, false);

        let mut msg = OutboundMessage::new("telegram", "42", "Report attached");
        msg.agent = Some("assistant".into());
        msg.files = Some(vec![OutboundFile {
            path: "/tmp/report.pdf".into(),
            caption: Some("weekly".into()),
        }]);
        let id = s.queue.write(&msg).await.unwrap();

        assert_eq!(s.deliver_next().await.unwrap(), Delivery::Delivered(id));
        assert_eq!(
            channel.ops().await,
            vec![
                Op::Send {
                    destination: "42".into(),
                    text: "Report attached".into()
                },
                Op::File {
                    destination: "42".into(),
                    path: "/tmp/report.pdf".into(),
                    caption: Some("weekly".into())
                },
            ]
        );
        assert_eq!(s.queue.pending(QueueName::Outgoing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_claims_own_channel_and_agent() {
        let tmp = TempDir::new().unwrap();
        let channel = MockChannel::new(ChannelKind::Telegram, 4096);
        let s = sender(&tmp, &channel, false);

        s.queue
            .write(&OutboundMessage::new("discord", "1", "not mine"))
            .await
            .unwrap();
        let mut other = OutboundMessage::new("telegram", "1", "other agent");
        other.agent = Some("coder".into());
        s.queue.write(&other).await.unwrap();
        s.queue
            .write(&OutboundMessage::new("telegram", "1", "unaddressed"))
            .await
            .unwrap();

        assert_eq!(s.deliver_next().await.unwrap(), Delivery::Idle);
        assert_eq!(s.queue.pending(QueueName::Outgoing).await.unwrap(), 3);

        let default_sender = sender(&tmp, &channel, true);
        assert!(matches!(
            default_sender.deliver_next().await.unwrap(),
            Delivery::Delivered(_)
        ));
    }

    #[tokio::test]
    async fn permanent_failure_drops_message() {
        let tmp = TempDir::new().unwrap();
        let channel = MockChannel::new(ChannelKind::Telegram, 4096);
        let s = sender(&tmp, &channel, true);
        let id = s
            .queue
            .write(&OutboundMessage::new("telegram", "not-a-chat", "hi"))
            .await
            .unwrap();

        channel
            .fail_next_with(|| ChannelError::InvalidDestination("not-a-chat".into()))
            .await;
        assert_eq!(s.deliver_next().await.unwrap(), Delivery::Dropped(id));
        assert_eq!(s.queue.pending(QueueName::Outgoing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_give_up() {
        let tmp = TempDir::new().unwrap();
        let channel = MockChannel::new(ChannelKind::Telegram, 4096);
        let s = sender(&tmp, &channel, true);
        let id = s
            .queue
            .write(&OutboundMessage::new("telegram", "42", "hi"))
            .await
            .unwrap();

        for attempt in 1..MAX_DELIVERY_ATTEMPTS {
            channel
                .fail_next_with(|| ChannelError::Api("timeout".into()))
                .await;
            assert_eq!(
                s.deliver_next().await.unwrap(),
                Delivery::Retrying {
                    id: id.clone(),
                    attempts: attempt
                }
            );
        }
        assert_eq!(s.queue.pending(QueueName::Outgoing).await.unwrap(), 1);

        channel
            .fail_next_with(|| ChannelError::Api("timeout".into()))
            .await;
        assert_eq!(s.deliver_next().await.unwrap(), Delivery::Dropped(id));
        assert_eq!(s.queue.pending(QueueName::Outgoing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unroutable_messages_are_set_aside_and_routable_ones_kept() {
        let tmp = TempDir::new().unwrap();
        let queue = DurableQueue::new(tmp.path());
        let mut registry = ChannelRegistry::default();
        registry.insert("assistant", MockChannel::new(ChannelKind::Telegram, 4096));

        queue
            .write(&OutboundMessage::new("telegram", "1", "kept"))
            .await
            .unwrap();
        queue
            .write(&OutboundMessage::new("slack", "C1", "no such channel"))
            .await
            .unwrap();
        queue
            .write(&OutboundMessage::new("discord", "1", "no discord bot"))
            .await
            .unwrap();
        let mut stranger = OutboundMessage::new("telegram", "1", "unknown agent");
        stranger.agent = Some("coder".into());
        queue.write(&stranger).await.unwrap();

        assert_eq!(set_aside_unroutable(&queue, &registry).await.unwrap(), 3);
        assert_eq!(queue.pending(QueueName::Outgoing).await.unwrap(), 1);
        assert_eq!(std::fs::read_dir(queue.errors_dir()).unwrap().count(), 3);

        let left = queue.read_oldest::<OutboundMessage>().await.unwrap().unwrap();
        assert_eq!(left.payload.message, "kept");
        assert_eq!(set_aside_unroutable(&queue, &registry).await.unwrap(), 0);
    }
}

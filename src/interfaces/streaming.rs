//! Edit-in-place rendering of agent output as it streams in.
//!
//! The reply is kept as one or more platform messages. New text is appended
//! to a buffer and rendered at most once per throttle period by editing the
//! last message, spilling into new messages when the platform limit is hit.
//! On completion the progress messages are deleted and the complete text is
//! sent fresh.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{Channel, ChannelError, MessageRef, chunk_message};

pub const EMPTY_RESPONSE: &str = "(the agent returned no output)";

const MIN_TICK: Duration = Duration::from_millis(50);

pub struct StreamingReply {
    channel: Arc<dyn Channel>,
    destination: String,
    throttle: Duration,
    buffer: String,
    sent: Vec<(MessageRef, String)>,
    last_render: Option<Instant>,
    dirty: bool,
}

impl StreamingReply {
    pub fn new(channel: Arc<dyn Channel>, destination: impl Into<String>, throttle: Duration) -> Self {
        Self {
            channel,
            destination: destination.into(),
            throttle,
            buffer: String::new(),
            sent: Vec::new(),
            last_render: None,
            dirty: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageRef> {
        self.sent.iter().map(|(m, _)| m)
    }

    /// Append a chunk. Renders right away if the throttle period has passed.
    pub async fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.push_str(chunk);
        self.dirty = true;
        if self.throttle_elapsed() {
            self.render_logged().await;
        }
    }

    /// Render pending text if there is any and the throttle allows it.
    pub async fn tick(&mut self) {
        if self.dirty && self.throttle_elapsed() {
            self.render_logged().await;
        }
    }

    /// Drain `chunks` until the sender side closes, rendering as it goes.
    pub async fn consume(&mut self, mut chunks: mpsc::Receiver<String>) {
        let mut ticker = tokio::time::interval(self.throttle.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => self.push(&chunk).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Replace the progress messages with the complete response.
    pub async fn finish(&mut self, final_text: &str) -> Result<(), ChannelError> {
        let final_text = final_text.trim();
        self.buffer = if final_text.is_empty() {
            EMPTY_RESPONSE.to_string()
        } else {
            final_text.to_string()
        };
        self.last_render = Some(Instant::now());
        self.dirty = false;

        for (message, _) in std::mem::take(&mut self.sent) {
            // A progress message the user already removed is not an error.
            if let Err(e) = self.channel.delete_message(&message).await {
                warn!(
                    "Could not remove progress message {} in {}: {}",
                    message.message_id, self.destination, e
                );
            }
        }

        for piece in chunk_message(&self.buffer, self.channel.max_message_len()) {
            let message = self.channel.send_message(&self.destination, &piece).await?;
            self.sent.push((message, piece));
        }
        Ok(())
    }

    /// Replace whatever was streamed with an error notice.
    pub async fn fail(&mut self, notice: &str) -> Result<(), ChannelError> {
        if self.buffer.trim().is_empty() {
            self.buffer = notice.to_string();
        } else {
            self.buffer = format!("{}\n\n{}", self.buffer.trim_end(), notice);
        }
        self.render().await
    }

    fn throttle_elapsed(&self) -> bool {
        self.last_render
            .is_none_or(|t| t.elapsed() >= self.throttle)
    }

    async fn render_logged(&mut self) {
        if let Err(e) = self.render().await {
            warn!("Streaming update to {} failed: {}", self.destination, e);
        }
    }

    async fn render(&mut self) -> Result<(), ChannelError> {
        self.last_render = Some(Instant::now());
        self.dirty = false;

        let text = self.buffer.trim_end();
        if text.trim().is_empty() {
            return Ok(());
        }
        let pieces = chunk_message(text, self.channel.max_message_len());

        for (i, piece) in pieces.iter().enumerate() {
            match self.sent.get_mut(i) {
                Some((_, rendered)) if rendered == piece => {}
                Some((message, rendered)) => {
                    self.channel.edit_message(message, piece).await?;
                    *rendered = piece.clone();
                }
                None => {
                    let message = self.channel.send_message(&self.destination, piece).await?;
                    self.sent.push((message, piece.clone()));
                }
            }
        }

        while self.sent.len() > pieces.len() {
            if let Some((message, _)) = self.sent.pop() {
                debug!("Removing surplus streamed message {}", message.message_id);
                self.channel.delete_message(&message).await?;
            }
        }
        Ok(())
    }
}

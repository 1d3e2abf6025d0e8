use anyhow::Result;
use async_trait::async_trait;
use serenity::Client;
use serenity::all::{
    ChannelId, Context, CreateAttachment, CreateMessage, EditMessage, EventHandler,
    GatewayIntents, Http, Message, MessageId, Ready,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Channel, ChannelError, ChannelListener, MessageRef, sender_allowed};
use crate::core::config::ChannelKind;
use crate::core::queue::{Attachment, AttachmentKind, DurableQueue, InboundMessage};

pub const DISCORD_MAX_MESSAGE_LEN: usize = 2000;

fn channel_id(destination: &str) -> Result<ChannelId, ChannelError> {
    match destination.trim().parse::<u64>() {
        Ok(id) if id != 0 => Ok(ChannelId::new(id)),
        _ => Err(ChannelError::InvalidDestination(destination.to_string())),
    }
}

fn message_id(message: &MessageRef) -> Result<MessageId, ChannelError> {
    match message.message_id.parse::<u64>() {
        Ok(id) if id != 0 => Ok(MessageId::new(id)),
        _ => Err(ChannelError::MessageNotFound(message.message_id.clone())),
    }
}

fn map_err(destination: &str, e: serenity::Error) -> ChannelError {
    if let serenity::Error::Http(http) = &e {
        match http.status_code().map(|s| s.as_u16()) {
            Some(403) | Some(404) => {
                return ChannelError::InvalidDestination(destination.to_string());
            }
            _ => {}
        }
    }
    ChannelError::Api(e.to_string())
}

pub struct DiscordChannel {
    http: Arc<Http>,
}

impl DiscordChannel {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    fn max_message_len(&self) -> usize {
        DISCORD_MAX_MESSAGE_LEN
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<MessageRef, ChannelError> {
        let sent = channel_id(destination)?
            .say(&self.http, text)
            .await
            .map_err(|e| map_err(destination, e))?;
        Ok(MessageRef {
            destination: destination.to_string(),
            message_id: sent.id.get().to_string(),
        })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        channel_id(&message.destination)?
            .edit_message(
                &self.http,
                message_id(message)?,
                EditMessage::new().content(text),
            )
            .await
            .map_err(|e| map_err(&message.destination, e))?;
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<(), ChannelError> {
        channel_id(&message.destination)?
            .delete_message(&self.http, message_id(message)?)
            .await
            .map_err(|e| map_err(&message.destination, e))
    }

    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef, ChannelError> {
        let channel = channel_id(destination)?;
        let attachment = CreateAttachment::path(path)
            .await
            .map_err(|e| match e {
                serenity::Error::Io(source) => ChannelError::File {
                    path: path.to_path_buf(),
                    source,
                },
                other => ChannelError::Api(other.to_string()),
            })?;
        let mut builder = CreateMessage::new();
        if let Some(caption) = caption {
            builder = builder.content(caption);
        }
        let sent = channel
            .send_files(&self.http, vec![attachment], builder)
            .await
            .map_err(|e| map_err(destination, e))?;
        Ok(MessageRef {
            destination: destination.to_string(),
            message_id: sent.id.get().to_string(),
        })
    }

    async fn send_typing(&self, destination: &str) -> Result<(), ChannelError> {
        channel_id(destination)?
            .broadcast_typing(&self.http)
            .await
            .map_err(|e| map_err(destination, e))
    }
}

fn attachment_kind(content_type: Option<&str>) -> AttachmentKind {
    match content_type.and_then(|c| c.split('/').next()) {
        Some("image") => AttachmentKind::Photo,
        Some("audio") => AttachmentKind::Audio,
        Some("video") => AttachmentKind::Video,
        _ => AttachmentKind::Document,
    }
}

struct Handler {
    agent_id: String,
    queue: DurableQueue,
    allowed_senders: HashSet<String>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let author_id = msg.author.id.get().to_string();
        if !sender_allowed(
            &self.allowed_senders,
            &[author_id.as_str(), msg.author.name.as_str()],
        ) {
            warn!(
                "[{}] Ignoring Discord message from unlisted sender {}",
                self.agent_id, msg.author.name
            );
            return;
        }

        let attachments: Vec<Attachment> = msg
            .attachments
            .iter()
            .map(|a| Attachment {
                kind: attachment_kind(a.content_type.as_deref()),
                file_id: a.url.clone(),
                mime_type: a.content_type.clone(),
            })
            .collect();
        if msg.content.trim().is_empty() && attachments.is_empty() {
            return;
        }

        let mut inbound = InboundMessage::new(
            "discord",
            msg.author.name.clone(),
            author_id,
            msg.content.clone(),
        )
        .with_agent(self.agent_id.as_str());
        inbound.message_id = msg.id.get().to_string();
        inbound.session = Some(msg.channel_id.get().to_string());
        if !attachments.is_empty() {
            inbound.attachments = Some(attachments);
        }

        match self.queue.write(&inbound).await {
            Ok(id) => info!("[{}] Queued Discord message {}", self.agent_id, id),
            Err(e) => error!("[{}] Failed to queue Discord message: {}", self.agent_id, e),
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!(
            "[{}] Discord Bot connected as {}",
            self.agent_id, ready.user.name
        );
    }
}

pub struct DiscordListener {
    agent_id: String,
    token: String,
    queue: DurableQueue,
    allowed_senders: HashSet<String>,
}

impl DiscordListener {
    pub fn new(
        agent_id: String,
        token: String,
        queue: DurableQueue,
        allowed_senders: HashSet<String>,
    ) -> Self {
        Self {
            agent_id,
            token,
            queue,
            allowed_senders,
        }
    }
}

#[async_trait]
impl ChannelListener for DiscordListener {
    async fn listen(&self, shutdown: CancellationToken) -> Result<()> {
        let handler = Handler {
            agent_id: self.agent_id.clone(),
            queue: self.queue.clone(),
            allowed_senders: self.allowed_senders.clone(),
        };
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await?;

        let shards = client.shard_manager.clone();
        let watcher = tokio::spawn(async move {
            shutdown.cancelled().await;
            shards.shutdown_all().await;
        });
        let result = client.start().await;
        watcher.abort();
        result?;
        Ok(())
    }
}

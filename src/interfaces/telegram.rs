use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use teloxide::payloads::{SendDocumentSetters, SendPhotoSetters};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, MessageId};
use teloxide::{ApiError, RequestError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Channel, ChannelError, ChannelListener, MessageRef, sender_allowed};
use crate::core::config::ChannelKind;
use crate::core::queue::{Attachment, AttachmentKind, DurableQueue, InboundMessage};

pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

pub fn bot(token: &str) -> Bot {
    Bot::new(token)
}

fn chat_id(destination: &str) -> Result<ChatId, ChannelError> {
    destination
        .trim()
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| ChannelError::InvalidDestination(destination.to_string()))
}

fn message_id(message: &MessageRef) -> Result<MessageId, ChannelError> {
    message
        .message_id
        .parse::<i32>()
        .map(MessageId)
        .map_err(|_| ChannelError::MessageNotFound(message.message_id.clone()))
}

fn map_err(destination: &str, e: RequestError) -> ChannelError {
    match e {
        RequestError::Api(ApiError::ChatNotFound | ApiError::BotBlocked) => {
            ChannelError::InvalidDestination(destination.to_string())
        }
        RequestError::Api(
            ApiError::MessageToEditNotFound | ApiError::MessageToDeleteNotFound,
        ) => ChannelError::MessageNotFound(destination.to_string()),
        other => ChannelError::Api(other.to_string()),
    }
}

pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    fn max_message_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LEN
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<MessageRef, ChannelError> {
        let sent = self
            .bot
            .send_message(chat_id(destination)?, text)
            .await
            .map_err(|e| map_err(destination, e))?;
        Ok(MessageRef {
            destination: destination.to_string(),
            message_id: sent.id.0.to_string(),
        })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        match self
            .bot
            .edit_message_text(chat_id(&message.destination)?, message_id(message)?, text)
            .await
        {
            Ok(_) => Ok(()),
            // Re-rendering identical text is harmless.
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(map_err(&message.destination, e)),
        }
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<(), ChannelError> {
        self.bot
            .delete_message(chat_id(&message.destination)?, message_id(message)?)
            .await
            .map_err(|e| map_err(&message.destination, e))?;
        Ok(())
    }

    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef, ChannelError> {
        if let Err(source) = tokio::fs::metadata(path).await {
            return Err(ChannelError::File {
                path: path.to_path_buf(),
                source,
            });
        }
        let chat = chat_id(destination)?;
        let is_image = mime_guess::from_path(path)
            .first()
            .is_some_and(|m| m.type_() == mime_guess::mime::IMAGE);

        let sent = if is_image {
            let mut req = self.bot.send_photo(chat, InputFile::file(path));
            if let Some(caption) = caption {
                req = req.caption(caption);
            }
            req.await
        } else {
            let mut req = self.bot.send_document(chat, InputFile::file(path));
            if let Some(caption) = caption {
                req = req.caption(caption);
            }
            req.await
        }
        .map_err(|e| map_err(destination, e))?;

        Ok(MessageRef {
            destination: destination.to_string(),
            message_id: sent.id.0.to_string(),
        })
    }

    async fn send_typing(&self, destination: &str) -> Result<(), ChannelError> {
        self.bot
            .send_chat_action(chat_id(destination)?, ChatAction::Typing)
            .await
            .map_err(|e| map_err(destination, e))?;
        Ok(())
    }
}

/// Turn a Telegram message into an inbound queue entry. Returns `None` for
/// messages with neither text nor media.
pub fn inbound_from_message(agent_id: &str, msg: &Message) -> Option<InboundMessage> {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();

    let mut attachments = Vec::new();
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        attachments.push(Attachment {
            kind: AttachmentKind::Photo,
            file_id: photo.file.id.to_string(),
            mime_type: Some("image/jpeg".to_string()),
        });
    }
    if let Some(doc) = msg.document() {
        attachments.push(Attachment {
            kind: AttachmentKind::Document,
            file_id: doc.file.id.to_string(),
            mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(voice) = msg.voice() {
        attachments.push(Attachment {
            kind: AttachmentKind::Voice,
            file_id: voice.file.id.to_string(),
            mime_type: voice.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(audio) = msg.audio() {
        attachments.push(Attachment {
            kind: AttachmentKind::Audio,
            file_id: audio.file.id.to_string(),
            mime_type: audio.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(video) = msg.video() {
        attachments.push(Attachment {
            kind: AttachmentKind::Video,
            file_id: video.file.id.to_string(),
            mime_type: video.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(sticker) = msg.sticker() {
        attachments.push(Attachment {
            kind: AttachmentKind::Sticker,
            file_id: sticker.file.id.to_string(),
            mime_type: None,
        });
    }

    if text.trim().is_empty() && attachments.is_empty() {
        return None;
    }

    let chat = msg.chat.id.0;
    let (sender, sender_id) = match &msg.from {
        Some(user) => (
            user.username
                .clone()
                .unwrap_or_else(|| user.first_name.clone()),
            user.id.0 as i64,
        ),
        None => (format!("chat {}", chat), chat),
    };

    let mut inbound = InboundMessage::new("telegram", sender, sender_id, text)
        .with_agent(agent_id);
    inbound.message_id = format!("{}:{}", chat, msg.id.0);
    inbound.session = Some(chat.to_string());
    if !attachments.is_empty() {
        inbound.attachments = Some(attachments);
    }
    Some(inbound)
}

pub struct TelegramListener {
    agent_id: String,
    bot: Bot,
    queue: DurableQueue,
    allowed_senders: HashSet<String>,
}

impl TelegramListener {
    pub fn new(
        agent_id: String,
        bot: Bot,
        queue: DurableQueue,
        allowed_senders: HashSet<String>,
    ) -> Self {
        Self {
            agent_id,
            bot,
            queue,
            allowed_senders,
        }
    }
}

#[async_trait]
impl ChannelListener for TelegramListener {
    async fn listen(&self, shutdown: CancellationToken) -> Result<()> {
        let me = self.bot.get_me().await?;
        info!(
            "[{}] Telegram bot connected as @{}",
            self.agent_id,
            me.username()
        );

        let agent_id = self.agent_id.clone();
        let queue = self.queue.clone();
        let allowed = self.allowed_senders.clone();

        let handler = Update::filter_message().endpoint(move |msg: Message| {
            let agent_id = agent_id.clone();
            let queue = queue.clone();
            let allowed = allowed.clone();
            async move {
                let user_id = msg.from.as_ref().map(|u| u.id.0.to_string());
                let username = msg.from.as_ref().and_then(|u| u.username.clone());
                let ids: Vec<&str> = [user_id.as_deref(), username.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                if !sender_allowed(&allowed, &ids) {
                    warn!(
                        "[{}] Ignoring Telegram message from unlisted sender {:?}",
                        agent_id, ids
                    );
                    return respond(());
                }
                let Some(inbound) = inbound_from_message(&agent_id, &msg) else {
                    return respond(());
                };
                match queue.write(&inbound).await {
                    Ok(id) => info!("[{}] Queued Telegram message {}", agent_id, id),
                    Err(e) => error!("[{}] Failed to queue Telegram message: {}", agent_id, e),
                }
                respond(())
            }
        });

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler).build();
        let stop = dispatcher.shutdown_token();
        let watcher = tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Ok(done) = stop.shutdown() {
                done.await;
            }
        });
        dispatcher.dispatch().await;
        watcher.abort();
        Ok(())
    }
}

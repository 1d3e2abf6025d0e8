use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The two logical queues living under a queue root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Incoming,
    Outgoing,
}

impl QueueName {
    pub fn dir_name(self) -> &'static str {
        match self {
            QueueName::Incoming => "incoming",
            QueueName::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A payload that can be stored in one of the queues.
pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: QueueName;

    fn validate(&self) -> Result<(), ValidationError>;

    /// Agent this message is addressed to, if any.
    fn target_agent(&self) -> Option<&str> {
        None
    }
}

/// Channel-specific sender identifier. Telegram hands out numbers, most
/// other channels use strings; both are accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderId {
    Number(i64),
    Text(String),
}

impl SenderId {
    fn is_blank(&self) -> bool {
        matches!(self, SenderId::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderId::Number(n) => write!(f, "{}", n),
            SenderId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for SenderId {
    fn from(value: &str) -> Self {
        SenderId::Text(value.to_string())
    }
}

impl From<String> for SenderId {
    fn from(value: String) -> Self {
        SenderId::Text(value)
    }
}

impl From<i64> for SenderId {
    fn from(value: i64) -> Self {
        SenderId::Number(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Document,
    Voice,
    Audio,
    Video,
    Sticker,
    #[serde(other)]
    Other,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Photo => "photo",
            AttachmentKind::Document => "document",
            AttachmentKind::Voice => "voice",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Sticker => "sticker",
            AttachmentKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Channel-native file reference (Telegram file id, Discord attachment URL, ...).
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    pub sender: String,
    pub sender_id: SenderId,
    pub message: String,
    /// Arrival time in epoch milliseconds.
    pub timestamp: i64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender: impl Into<String>,
        sender_id: impl Into<SenderId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender: sender.into(),
            sender_id: sender_id.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_id: uuid::Uuid::new_v4().to_string(),
            agent: None,
            token: None,
            attachments: None,
            session: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments.as_ref().is_some_and(|a| !a.is_empty())
    }
}

impl QueuePayload for InboundMessage {
    const QUEUE: QueueName = QueueName::Incoming;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.channel.trim().is_empty() {
            return Err(ValidationError::new("channel", "must not be empty"));
        }
        if self.sender_id.is_blank() {
            return Err(ValidationError::new("senderId", "must not be empty"));
        }
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::new("messageId", "must not be empty"));
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::new(
                "timestamp",
                "must be a positive epoch millisecond value",
            ));
        }
        if self.message.trim().is_empty() && !self.has_attachments() {
            return Err(ValidationError::new(
                "message",
                "must not be empty when there are no attachments",
            ));
        }
        if let Some(agent) = &self.agent
            && agent.trim().is_empty()
        {
            return Err(ValidationError::new("agent", "must not be blank when set"));
        }
        if let Some(attachments) = &self.attachments {
            for (i, a) in attachments.iter().enumerate() {
                if a.file_id.trim().is_empty() {
                    return Err(ValidationError::new(
                        format!("attachments[{}].fileId", i),
                        "must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }

    fn target_agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub channel: String,
    pub destination: String,
    pub message: String,
    /// Send time in epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<OutboundFile>>,
    /// Agent whose channel client should deliver this message. Any client
    /// of the right channel kind may claim it when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        destination: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            destination: destination.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            token: None,
            files: None,
            agent: None,
        }
    }

    pub fn has_files(&self) -> bool {
        self.files.as_ref().is_some_and(|f| !f.is_empty())
    }
}

impl QueuePayload for OutboundMessage {
    const QUEUE: QueueName = QueueName::Outgoing;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.channel.trim().is_empty() {
            return Err(ValidationError::new("channel", "must not be empty"));
        }
        if self.destination.trim().is_empty() {
            return Err(ValidationError::new("destination", "must not be empty"));
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::new(
                "timestamp",
                "must be a positive epoch millisecond value",
            ));
        }
        if self.message.trim().is_empty() && !self.has_files() {
            return Err(ValidationError::new(
                "message",
                "must not be empty when there are no files",
            ));
        }
        if let Some(files) = &self.files {
            for (i, f) in files.iter().enumerate() {
                if f.path.trim().is_empty() {
                    return Err(ValidationError::new(
                        format!("files[{}].path", i),
                        "must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }

    fn target_agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }
}

//! File-backed inbound/outbound message queues.
//!
//! Each message is one JSON file. Writers produce `<id>.json.tmp` and rename
//! it into place, so a `*.json` file is always complete. Readers pick the
//! oldest file by modification time; anything that fails to parse or validate
//! is moved into `errors/` and never handed out.

mod types;

pub use types::{
    Attachment, AttachmentKind, InboundMessage, OutboundFile, OutboundMessage, QueueName,
    QueuePayload, SenderId, ValidationError,
};

use rand::Rng;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

const MESSAGE_EXT: &str = ".json";
const TEMP_EXT: &str = ".json.tmp";
const ERRORS_DIR: &str = "errors";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("queue I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize queue message: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A message read from a queue, still present on disk until deleted.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    pub id: String,
    pub payload: T,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DurableQueue {
    root: PathBuf,
}

impl DurableQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, queue: QueueName) -> PathBuf {
        self.root.join(queue.dir_name())
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.root.join(ERRORS_DIR)
    }

    pub async fn initialize(&self) -> Result<(), QueueError> {
        for dir in [
            self.dir(QueueName::Incoming),
            self.dir(QueueName::Outgoing),
            self.errors_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }
        Ok(())
    }

    /// Validate and atomically store a payload in the queue its type belongs to.
    pub async fn write<T: QueuePayload>(&self, payload: &T) -> Result<String, QueueError> {
        payload.validate()?;
        let body = serde_json::to_vec_pretty(payload)?;

        let dir = self.dir(T::QUEUE);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let id = generate_id();
        let tmp_path = dir.join(format!("{}{}", id, TEMP_EXT));
        let final_path = dir.join(format!("{}{}", id, MESSAGE_EXT));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(io_err(&tmp_path))?;
        file.write_all(&body).await.map_err(io_err(&tmp_path))?;
        file.sync_all().await.map_err(io_err(&tmp_path))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(QueueError::Io {
                path: final_path,
                source: e,
            });
        }
        Ok(id)
    }

    pub async fn read_oldest<T: QueuePayload>(
        &self,
    ) -> Result<Option<QueuedMessage<T>>, QueueError> {
        self.read_oldest_where(|_: &T| true).await
    }

    /// Like [`read_oldest`](Self::read_oldest), but leaves messages addressed
    /// to any of `skip_agents` in the queue for another consumer.
    pub async fn read_oldest_skipping<T: QueuePayload>(
        &self,
        skip_agents: &HashSet<String>,
    ) -> Result<Option<QueuedMessage<T>>, QueueError> {
        self.read_oldest_where(|payload: &T| {
            payload
                .target_agent()
                .is_none_or(|agent| !skip_agents.contains(agent))
        })
        .await
    }

    /// Oldest valid message accepted by `accept`. Rejected messages stay in
    /// the queue untouched; corrupt ones are quarantined.
    pub async fn read_oldest_where<T, F>(
        &self,
        accept: F,
    ) -> Result<Option<QueuedMessage<T>>, QueueError>
    where
        T: QueuePayload,
        F: Fn(&T) -> bool,
    {
        let dir = self.dir(T::QUEUE);
        for (path, name) in list_candidates(&dir).await? {
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                // Claimed by someone else between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(QueueError::Io { path, source: e }),
            };

            let parsed = serde_json::from_str::<T>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|payload| {
                    payload
                        .validate()
                        .map(|_| payload)
                        .map_err(|e| e.to_string())
                });

            match parsed {
                Ok(payload) => {
                    if !accept(&payload) {
                        continue;
                    }
                    let id = name.trim_end_matches(MESSAGE_EXT).to_string();
                    return Ok(Some(QueuedMessage { id, payload, path }));
                }
                Err(reason) => {
                    warn!(
                        "Quarantining corrupt {} message {}: {}",
                        T::QUEUE,
                        name,
                        reason
                    );
                    self.quarantine(&path, &name).await;
                }
            }
        }
        Ok(None)
    }

    /// Remove a message. Deleting an already-removed message is not an error.
    pub async fn delete(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        let path = self.dir(queue).join(format!("{}{}", id, MESSAGE_EXT));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::Io { path, source: e }),
        }
    }

    /// Number of message files currently waiting in a queue.
    pub async fn pending(&self, queue: QueueName) -> Result<usize, QueueError> {
        Ok(list_candidates(&self.dir(queue)).await?.len())
    }

    /// Move a valid but unusable message into `errors/` instead of deleting it.
    pub async fn set_aside<T>(&self, message: &QueuedMessage<T>) {
        let name = format!("{}{}", message.id, MESSAGE_EXT);
        self.quarantine(&message.path, &name).await;
    }

    async fn quarantine(&self, path: &Path, name: &str) {
        let errors = self.errors_dir();
        if let Err(e) = tokio::fs::create_dir_all(&errors).await {
            error!("Failed to create quarantine dir {:?}: {}", errors, e);
            return;
        }
        let mut target = errors.join(name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let stem = name.trim_end_matches(MESSAGE_EXT);
            target = errors.join(format!(
                "{}.{}{}",
                stem,
                chrono::Utc::now().timestamp_millis(),
                MESSAGE_EXT
            ));
        }
        if let Err(e) = tokio::fs::rename(path, &target).await
            && e.kind() != ErrorKind::NotFound
        {
            error!("Failed to quarantine {:?} into {:?}: {}", path, target, e);
        }
    }
}

/// `<epoch millis>-<random suffix>`, sortable by creation time.
pub fn generate_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// Complete message files in `dir`, oldest modification time first.
async fn list_candidates(dir: &Path) -> Result<Vec<(PathBuf, String)>, QueueError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(QueueError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut found: Vec<(SystemTime, String, PathBuf)> = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err(dir))? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(MESSAGE_EXT) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, name, entry.path()));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(found
        .into_iter()
        .map(|(_, name, path)| (path, name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup_queue() -> (TempDir, DurableQueue) {
        let tmp = TempDir::new().unwrap();
        let queue = DurableQueue::new(tmp.path().join("queue"));
        queue.initialize().await.unwrap();
        (tmp, queue)
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            channel: "x".to_string(),
            sender: "A".to_string(),
            sender_id: SenderId::Text("1".to_string()),
            message: text.to_string(),
            timestamp: 1_771_000_000_000,
            message_id: "m1".to_string(),
            agent: None,
            token: None,
            attachments: None,
            session: None,
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    #[tokio::test]
    async fn write_read_delete_roundtrip_leaves_no_trace() {
        let (_tmp, queue) = setup_queue().await;
        let msg = inbound("hi");

        let id = queue.write(&msg).await.unwrap();
        let id_pattern = regex::Regex::new(r"^\d{13}-[a-z0-9]{6}$").unwrap();
        assert!(id_pattern.is_match(&id), "unexpected id format: {}", id);

        let read = queue
            .read_oldest::<InboundMessage>()
            .await
            .unwrap()
            .expect("message should be readable");
        assert_eq!(read.id, id);
        assert_eq!(read.payload, msg);

        queue.delete(QueueName::Incoming, &read.id).await.unwrap();
        assert!(
            queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .is_none()
        );

        assert!(files_in(&queue.dir(QueueName::Incoming)).is_empty());
        assert!(files_in(&queue.dir(QueueName::Outgoing)).is_empty());
        assert!(files_in(&queue.errors_dir()).is_empty());
    }

    #[tokio::test]
    async fn outbound_roundtrip_uses_outgoing_dir() {
        let (_tmp, queue) = setup_queue().await;
        let mut msg = OutboundMessage::new("telegram", "42", "done");
        msg.files = Some(vec![OutboundFile {
            path: "/tmp/report.pdf".to_string(),
            caption: Some("report".to_string()),
        }]);

        queue.write(&msg).await.unwrap();
        assert_eq!(files_in(&queue.dir(QueueName::Outgoing)).len(), 1);
        assert!(files_in(&queue.dir(QueueName::Incoming)).is_empty());

        let read = queue
            .read_oldest::<OutboundMessage>()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.payload, msg);
    }

    #[tokio::test]
    async fn invalid_write_fails_before_touching_disk() {
        let (_tmp, queue) = setup_queue().await;
        let mut msg = inbound("hi");
        msg.channel = "  ".to_string();

        let err = queue.write(&msg).await.unwrap_err();
        match err {
            QueueError::Validation(v) => assert_eq!(v.field, "channel"),
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(files_in(&queue.dir(QueueName::Incoming)).is_empty());
        assert!(files_in(&queue.errors_dir()).is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_allowed_with_attachments() {
        let (_tmp, queue) = setup_queue().await;
        let mut msg = inbound("");
        assert!(queue.write(&msg).await.is_err());

        msg.attachments = Some(vec![Attachment {
            kind: AttachmentKind::Photo,
            file_id: "AgAD123".to_string(),
            mime_type: Some("image/jpeg".to_string()),
        }]);
        assert!(queue.write(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_files_are_quarantined_and_skipped() {
        let (_tmp, queue) = setup_queue().await;
        let incoming = queue.dir(QueueName::Incoming);

        let broken = incoming.join("1000-broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        set_mtime(&broken, 1_000);

        let invalid = incoming.join("1001-invalid.json");
        std::fs::write(
            &invalid,
            r#"{"channel":"","sender":"A","senderId":"1","message":"x","timestamp":1,"messageId":"m"}"#,
        )
        .unwrap();
        set_mtime(&invalid, 1_001);

        let id = queue.write(&inbound("good")).await.unwrap();

        let read = queue
            .read_oldest::<InboundMessage>()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.id, id);

        let mut quarantined = files_in(&queue.errors_dir());
        quarantined.sort();
        assert_eq!(quarantined, vec!["1000-broken.json", "1001-invalid.json"]);
        assert!(!broken.exists());
        assert!(!invalid.exists());
    }

    #[tokio::test]
    async fn only_corrupt_files_yields_none() {
        let (_tmp, queue) = setup_queue().await;
        std::fs::write(queue.dir(QueueName::Incoming).join("1-x.json"), "[]").unwrap();
        assert!(
            queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(files_in(&queue.errors_dir()).len(), 1);
    }

    #[tokio::test]
    async fn reads_follow_modification_time_order() {
        let (_tmp, queue) = setup_queue().await;
        let mut ids = Vec::new();
        for i in 0..5u64 {
            let mut msg = inbound(&format!("msg {}", i));
            msg.message_id = format!("m{}", i);
            let id = queue.write(&msg).await.unwrap();
            let path = queue
                .dir(QueueName::Incoming)
                .join(format!("{}{}", id, MESSAGE_EXT));
            set_mtime(&path, 10_000 + i);
            ids.push(id);
        }

        for expected in 0..5 {
            let read = queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .unwrap();
            assert_eq!(read.payload.message, format!("msg {}", expected));
            assert_eq!(read.id, ids[expected]);
            queue.delete(QueueName::Incoming, &read.id).await.unwrap();
        }
        assert!(
            queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn modification_time_wins_over_id_order() {
        let (_tmp, queue) = setup_queue().await;
        let first = queue.write(&inbound("first written")).await.unwrap();
        let second = queue.write(&inbound("second written")).await.unwrap();
        let dir = queue.dir(QueueName::Incoming);
        set_mtime(&dir.join(format!("{}.json", first)), 2_000);
        set_mtime(&dir.join(format!("{}.json", second)), 1_000);

        let read = queue
            .read_oldest::<InboundMessage>()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.id, second);
    }

    #[tokio::test]
    async fn temp_files_are_never_read() {
        let (_tmp, queue) = setup_queue().await;
        let tmp_file = queue.dir(QueueName::Incoming).join("5-abc.json.tmp");
        std::fs::write(&tmp_file, serde_json::to_string(&inbound("x")).unwrap()).unwrap();

        assert!(
            queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .is_none()
        );
        assert!(tmp_file.exists());
        assert!(files_in(&queue.errors_dir()).is_empty());
    }

    #[tokio::test]
    async fn missing_directory_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let queue = DurableQueue::new(tmp.path().join("never-created"));
        assert!(
            queue
                .read_oldest::<InboundMessage>()
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(queue.pending(QueueName::Incoming).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_tmp, queue) = setup_queue().await;
        let id = queue.write(&inbound("hi")).await.unwrap();
        queue.delete(QueueName::Incoming, &id).await.unwrap();
        queue.delete(QueueName::Incoming, &id).await.unwrap();
        queue
            .delete(QueueName::Incoming, "0-doesnotexist")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn skip_filter_leaves_messages_for_other_agents() {
        let (_tmp, queue) = setup_queue().await;

        let for_other = inbound("for other").with_agent("other");
        let other_id = queue.write(&for_other).await.unwrap();
        set_mtime(
            &queue.dir(QueueName::Incoming).join(format!("{}.json", other_id)),
            100,
        );
        let mine_id = queue.write(&inbound("untargeted")).await.unwrap();
        set_mtime(
            &queue.dir(QueueName::Incoming).join(format!("{}.json", mine_id)),
            200,
        );

        let skip: HashSet<String> = ["other".to_string()].into_iter().collect();
        let read = queue
            .read_oldest_skipping::<InboundMessage>(&skip)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.id, mine_id);

        // The skipped message is still there for its owner.
        assert_eq!(queue.pending(QueueName::Incoming).await.unwrap(), 2);
        let read = queue
            .read_oldest::<InboundMessage>()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.id, other_id);
    }

    #[test]
    fn sender_id_accepts_numbers_and_strings() {
        let numeric: InboundMessage = serde_json::from_str(
            r#"{"channel":"telegram","sender":"A","senderId":42,"message":"x","timestamp":5,"messageId":"m"}"#,
        )
        .unwrap();
        assert_eq!(numeric.sender_id, SenderId::Number(42));
        assert_eq!(numeric.sender_id.to_string(), "42");

        let text: InboundMessage = serde_json::from_str(
            r#"{"channel":"discord","sender":"A","senderId":"9911","message":"x","timestamp":5,"messageId":"m"}"#,
        )
        .unwrap();
        assert_eq!(text.sender_id, SenderId::Text("9911".to_string()));
    }
}

mod state_machine;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::dispatch::DispatchContext;
use crate::core::agent::{AgentRequest, AgentRunner, CancelHandle, StreamingRun};
use crate::core::cache::TtlCache;
use crate::core::config::Config;
use crate::core::queue::DurableQueue;
use crate::interfaces::ChannelRegistry;

const CONFIG: &str = r#"
default_agent: assistant
agents:
  - id: assistant
    working_dir: /tmp
    command: agent-cli
    args: ["--print"]
    continue_args: ["--continue"]
  - id: coder
    working_dir: /tmp
    command: agent-cli
    streaming: false
"#;

fn config() -> Arc<Config> {
    Arc::new(Config::from_yaml(CONFIG).unwrap())
}

/// Answers every request with a fixed reply, streamed in `chunks`.
struct MockRunner {
    requests: StdMutex<Vec<AgentRequest>>,
    reply: Result<String, String>,
    chunks: Vec<String>,
}

impl MockRunner {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: StdMutex::new(Vec::new()),
            reply: Ok(text.to_string()),
            chunks: vec![text.to_string()],
        })
    }

    fn streaming(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            requests: StdMutex::new(Vec::new()),
            reply: Ok(chunks.concat()),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        })
    }

    fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: StdMutex::new(Vec::new()),
            reply: Err(error.to_string()),
            chunks: Vec::new(),
        })
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, request: &AgentRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.reply.clone().map_err(|e| anyhow!(e))
    }

    fn run_streaming(
        &self,
        request: AgentRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<StreamingRun> {
        self.requests.lock().unwrap().push(request);
        let (started_tx, started_rx) = oneshot::channel();
        let pieces = self.chunks.clone();
        let reply = self.reply.clone();
        let done = tokio::spawn(async move {
            let mut started = Some(started_tx);
            for piece in pieces {
                if let Some(tx) = started.take() {
                    let _ = tx.send(());
                }
                let _ = chunks.send(piece).await;
            }
            reply.map_err(|e| anyhow!(e))
        });
        Ok(StreamingRun {
            started: started_rx,
            done,
            cancel: CancelHandle::new(),
        })
    }
}

fn dispatch_context(
    root: &Path,
    runner: Arc<dyn AgentRunner>,
    channels: ChannelRegistry,
) -> DispatchContext {
    DispatchContext {
        config: config(),
        queue: DurableQueue::new(root.join("queue")),
        runner,
        channels,
        reset_dir: root.join("reset"),
        stream_throttle: Duration::ZERO,
        dedupe: Arc::new(TtlCache::new(Duration::from_secs(600), 100)),
        typing: Arc::new(TtlCache::new(Duration::from_secs(600), 100)),
    }
}

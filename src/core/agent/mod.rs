//! Invocation of the external agent process.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::AgentConfig;

/// One invocation of an agent with a single prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub agent_id: String,
    pub working_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub prompt: String,
}

impl AgentRequest {
    /// `fresh` drops the continue-conversation arguments, starting a new session.
    pub fn for_agent(agent: &AgentConfig, prompt: impl Into<String>, fresh: bool) -> Self {
        let mut args = agent.args.clone();
        if !fresh {
            args.extend(agent.continue_args.iter().cloned());
        }
        Self {
            agent_id: agent.id.clone(),
            working_dir: agent.working_dir.clone(),
            command: agent.command.clone(),
            args,
            prompt: prompt.into(),
        }
    }
}

/// Stops a streaming run. Safe to call from synchronous code and more than once.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A run in progress. `started` fires with the first chunk of output,
/// independently of `done` which resolves to the full response.
pub struct StreamingRun {
    pub started: oneshot::Receiver<()>,
    pub done: JoinHandle<Result<String>>,
    pub cancel: CancelHandle,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<String>;

    fn run_streaming(
        &self,
        request: AgentRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<StreamingRun>;
}

/// Runs the configured program in the agent's working directory with the
/// prompt as its final argument. Each stdout line is one stream chunk.
#[derive(Debug, Default, Clone)]
pub struct CliAgentRunner;

impl CliAgentRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .arg(&request.prompt)
            .current_dir(&request.working_dir)
            .env("CHATRELAY_AGENT", &request.agent_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn spawn_error(request: &AgentRequest, e: std::io::Error) -> anyhow::Error {
    anyhow!(
        "[{}] Failed to start `{}` in {:?}: {}",
        request.agent_id,
        request.command,
        request.working_dir,
        e
    )
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: &AgentRequest) -> Result<String> {
        info!("[{}] Running agent `{}`", request.agent_id, request.command);
        let output = Self::command(request)
            .output()
            .await
            .map_err(|e| spawn_error(request, e))?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "[{}] Agent exited with {}: {}",
                request.agent_id,
                output.status,
                err.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_streaming(
        &self,
        request: AgentRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<StreamingRun> {
        info!(
            "[{}] Running agent `{}` (streaming)",
            request.agent_id, request.command
        );
        let mut child = Self::command(&request)
            .spawn()
            .map_err(|e| spawn_error(&request, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("agent stderr was not captured"))?;

        let (started_tx, started_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let agent_id = request.agent_id.clone();

        let done = tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            });

            let mut reader = BufReader::new(stdout);
            // Partial reads stay in `buf` across select wakeups.
            let mut buf = Vec::new();
            let mut started = Some(started_tx);
            let mut full = String::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("[{}] Agent run cancelled", agent_id);
                        let _ = child.kill().await;
                        return Err(anyhow!("[{}] Agent run cancelled", agent_id));
                    }
                    read = reader.read_until(b'\n', &mut buf) => {
                        if read? == 0 {
                            break;
                        }
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        buf.clear();
                        if let Some(tx) = started.take() {
                            let _ = tx.send(());
                        }
                        full.push_str(&line);
                        full.push('\n');
                        if chunks.send(format!("{}\n", line)).await.is_err() {
                            debug!("[{}] Chunk receiver dropped", agent_id);
                        }
                    }
                }
            }

            let status = child.wait().await?;
            let err = stderr_task.await.unwrap_or_default();
            if !status.success() {
                return Err(anyhow!(
                    "[{}] Agent exited with {}: {}",
                    agent_id,
                    status,
                    err.trim()
                ));
            }
            Ok(full.trim().to_string())
        });

        Ok(StreamingRun {
            started: started_rx,
            done,
            cancel: CancelHandle { token },
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(script: &str, prompt: &str) -> AgentRequest {
        AgentRequest {
            agent_id: "test".into(),
            working_dir: std::env::temp_dir(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            prompt: prompt.into(),
        }
    }

    #[test]
    fn fresh_requests_drop_continue_args() {
        let agent: AgentConfig = serde_yaml::from_str(
            "{ id: a, working_dir: /w, command: claude, args: [--print], continue_args: [--continue] }",
        )
        .unwrap();
        let resumed = AgentRequest::for_agent(&agent, "hi", false);
        assert_eq!(resumed.args, vec!["--print", "--continue"]);
        let fresh = AgentRequest::for_agent(&agent, "hi", true);
        assert_eq!(fresh.args, vec!["--print"]);
        assert_eq!(fresh.working_dir, PathBuf::from("/w"));
    }

    #[tokio::test]
    async fn run_passes_prompt_as_last_argument() {
        // With `sh -c`, the first extra argument becomes $0.
        let out = CliAgentRunner::new()
            .run(&request("echo \"you said: $0\"", "hello"))
            .await
            .unwrap();
        assert_eq!(out, "you said: hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = CliAgentRunner::new()
            .run(&request("echo broken >&2; exit 2", "x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"), "{}", err);
    }

    #[tokio::test]
    async fn streaming_emits_lines_and_signals_start() {
        let (tx, mut rx) = mpsc::channel(16);
        let run = CliAgentRunner::new()
            .run_streaming(request("echo one; echo two", "p"), tx)
            .unwrap();

        run.started.await.unwrap();
        let full = run.done.await.unwrap().unwrap();
        assert_eq!(full, "one\ntwo");

        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await {
            got.push(chunk);
        }
        assert_eq!(got, vec!["one\n", "two\n"]);
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        let script = "printf 'caf\\351 ok\\n'; printf 'tail'";
        let blocking = CliAgentRunner::new().run(&request(script, "p")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let run = CliAgentRunner::new()
            .run_streaming(request(script, "p"), tx)
            .unwrap();
        let streamed = run.done.await.unwrap().unwrap();
        assert_eq!(streamed, "caf\u{FFFD} ok\ntail");
        assert_eq!(blocking, streamed);

        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await {
            got.push(chunk);
        }
        assert_eq!(got, vec!["caf\u{FFFD} ok\n", "tail\n"]);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_agent() {
        let (tx, _rx) = mpsc::channel(16);
        let run = CliAgentRunner::new()
            .run_streaming(request("echo ready; sleep 30", "p"), tx)
            .unwrap();
        run.started.await.unwrap();
        run.cancel.cancel();
        assert!(run.cancel.is_cancelled());
        assert!(run.done.await.unwrap().is_err());
    }
}

//! The relay daemon: startup gate, main loop and graceful drain.
//!
//! Startup loads the config, consults the crash guard and takes the PID
//! marker, in that order, before anything with side effects happens. The
//! loop then drains the inbound queue one message per iteration, ticks the
//! scheduler on its own cadence and fires per-agent heartbeats.

pub mod dispatch;
pub mod pid;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::agent::{AgentRunner, CliAgentRunner};
use crate::core::cache::TtlCache;
use crate::core::config::{Config, ConfigError};
use crate::core::crash_guard::{CrashGuard, human_duration};
use crate::core::heartbeat::{self, HeartbeatTracker};
use crate::core::lifecycle::LifecycleManager;
use crate::core::paths::DataPaths;
use crate::core::queue::{DurableQueue, InboundMessage, QueueName};
use crate::core::scheduler::{ActionContext, Scheduler, TickReport};
use crate::interfaces::outbound::{self, OutboundSender};
use crate::interfaces::{ChannelRegistry, ChannelSupervisor, build_channels};
use dispatch::{DispatchContext, DispatchOutcome};
use pid::PidFile;

const DEDUPE_CAPACITY: usize = 10_000;
const TYPING_CAPACITY: usize = 1_000;
const TYPING_TTL: Duration = Duration::from_secs(600);
const ATTEMPTS_TTL: Duration = Duration::from_secs(3600);
const SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Failures that stop the daemon before it does anything.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("refusing to start: {0}")]
    CrashLoop(String),
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("startup I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl DaemonState {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Draining => "draining",
            DaemonState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn can_transition(from: DaemonState, to: DaemonState) -> bool {
    if from == to {
        return true;
    }
    match from {
        DaemonState::Starting => matches!(to, DaemonState::Running | DaemonState::Stopped),
        DaemonState::Running => matches!(to, DaemonState::Draining),
        DaemonState::Draining => matches!(to, DaemonState::Stopped),
        DaemonState::Stopped => false,
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Could not install SIGTERM handler: {}", e),
        }
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C");
    }
}

/// Cancel `token` when a termination signal arrives.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });
}

/// Calendar time for cron schedules and heartbeat windows.
pub type WallClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Daemon {
    config: Arc<Config>,
    paths: DataPaths,
    runner: Arc<dyn AgentRunner>,
    clock: WallClock,
    state: watch::Sender<DaemonState>,
    _pid: PidFile,
}

impl Daemon {
    /// Load config, consult the crash guard, then write the PID marker.
    /// Nothing is written to disk unless every check passes.
    pub async fn startup(paths: DataPaths) -> Result<Self, StartupError> {
        let config = Config::load(&paths.config_file()).await?;
        let paths = paths.with_config(&config);

        let guard = crash_guard_for(&config, &paths);
        let decision = guard.should_allow_restart();
        if !decision.allowed {
            return Err(StartupError::CrashLoop(
                decision
                    .reason
                    .unwrap_or_else(|| "too many recent crashes".to_string()),
            ));
        }

        let pid = PidFile::acquire(paths.pid_file())?;
        info!(
            "chatrelay starting with {} agent(s), data in {}",
            config.agents.len(),
            paths.root().display()
        );

        let (state, _) = watch::channel(DaemonState::Starting);
        Ok(Self {
            config: Arc::new(config),
            paths,
            runner: Arc::new(CliAgentRunner::new()),
            clock: Arc::new(Utc::now),
            state,
            _pid: pid,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    fn transition(&self, to: DaemonState) -> Result<()> {
        let from = self.state();
        if !can_transition(from, to) {
            bail!("invalid daemon state transition {} -> {}", from, to);
        }
        info!("Daemon state: {} -> {}", from, to);
        self.state.send_replace(to);
        Ok(())
    }

    /// Run until `shutdown` is cancelled, then drain. Consumes the daemon so
    /// the PID marker is released on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let result = self.serve(&shutdown).await;
        if self.state() == DaemonState::Starting {
            self.transition(DaemonState::Stopped)?;
        }
        result
    }

    async fn serve(&self, shutdown: &CancellationToken) -> Result<()> {
        let settings = self.config.daemon.clone();
        let queue = DurableQueue::new(self.paths.queue_dir());
        queue.initialize().await?;
        for dir in [self.paths.tasks_dir().to_path_buf(), self.paths.reset_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let background = CancellationToken::new();
        let dedupe = Arc::new(TtlCache::new(settings.dedupe_ttl(), DEDUPE_CAPACITY));
        let typing = Arc::new(TtlCache::new(TYPING_TTL, TYPING_CAPACITY));
        let attempts = Arc::new(TtlCache::new(ATTEMPTS_TTL, DEDUPE_CAPACITY));
        let mut workers = JoinSet::new();
        workers.spawn(discard(dedupe.spawn_sweeper(SWEEP_EVERY, background.clone())));
        workers.spawn(discard(typing.spawn_sweeper(SWEEP_EVERY, background.clone())));
        workers.spawn(discard(attempts.spawn_sweeper(SWEEP_EVERY, background.clone())));

        let mut registry = ChannelRegistry::default();
        let mut lifecycle = LifecycleManager::new();
        for setup in build_channels(&self.config, &queue)? {
            registry.insert(&setup.agent_id, setup.client.clone());
            lifecycle.attach(Arc::new(Mutex::new(ChannelSupervisor::new(
                setup.agent_id,
                setup.listener,
            ))));
        }
        self.set_aside_unroutable(&queue, &registry).await;
        for (agent_id, client) in registry.iter() {
            let sender = OutboundSender::new(
                agent_id.clone(),
                client.clone(),
                queue.clone(),
                registry.is_default_sender(agent_id, client.kind()),
                attempts.clone(),
            );
            workers.spawn(sender.run(settings.poll_interval(), background.clone()));
        }

        if let Err(e) = lifecycle.start().await {
            lifecycle.shutdown().await;
            background.cancel();
            workers.shutdown().await;
            return Err(e);
        }
        self.transition(DaemonState::Running)?;

        let dispatcher = Arc::new(DispatchContext {
            config: self.config.clone(),
            queue: queue.clone(),
            runner: self.runner.clone(),
            channels: registry,
            reset_dir: self.paths.reset_dir(),
            stream_throttle: settings.stream_throttle(),
            dedupe,
            typing,
        });
        let scheduler = Arc::new(Scheduler::new(
            self.paths.tasks_dir(),
            ActionContext {
                queue: queue.clone(),
                config: self.config.clone(),
            },
        ));

        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut heartbeats = HeartbeatTracker::new();
        let mut last_tick: Option<Instant> = None;
        let mut last_sweep = Instant::now();

        while !shutdown.is_cancelled() {
            while let Some(joined) = inflight.try_join_next() {
                if let Err(e) = joined {
                    error!("Background task panicked: {}", e);
                }
            }

            let drained = match self.drain_one(&queue, &dispatcher, &mut inflight).await {
                Ok(drained) => drained,
                Err(e) => {
                    error!("Inbound queue read failed: {}", e);
                    false
                }
            };

            let now = Instant::now();
            if last_tick.is_none_or(|t| now.duration_since(t) >= settings.scheduler_interval()) {
                last_tick = Some(now);
                let scheduler = scheduler.clone();
                let wall = (self.clock)();
                inflight.spawn(async move {
                    let report = scheduler.tick(wall).await;
                    TickReport::log_completions(report.handles).await;
                });
            }

            fire_heartbeats(&self.config, &queue, &mut heartbeats, now, (self.clock)()).await;

            if now.duration_since(last_sweep) >= SWEEP_EVERY {
                last_sweep = now;
                self.set_aside_unroutable(&queue, &dispatcher.channels).await;
            }

            if drained {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(settings.poll_interval()) => {}
            }
        }

        self.transition(DaemonState::Draining)?;
        lifecycle.shutdown().await;
        background.cancel();

        let grace = settings.shutdown_grace();
        if !inflight.is_empty() {
            info!(
                "Waiting up to {} for {} in-flight task(s)",
                human_duration(grace),
                inflight.len()
            );
        }
        let drain = async {
            while inflight.join_next().await.is_some() {}
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed, aborting remaining tasks");
            inflight.shutdown().await;
            workers.shutdown().await;
        }

        self.transition(DaemonState::Stopped)?;
        info!("chatrelay stopped");
        Ok(())
    }

    /// Take the oldest inbound message off the queue and spawn its dispatch.
    /// The file is deleted before dispatch starts.
    async fn drain_one(
        &self,
        queue: &DurableQueue,
        dispatcher: &Arc<DispatchContext>,
        inflight: &mut JoinSet<()>,
    ) -> Result<bool> {
        let Some(msg) = queue.read_oldest::<InboundMessage>().await? else {
            return Ok(false);
        };
        if let Err(e) = queue.delete(QueueName::Incoming, &msg.id).await {
            error!("Could not claim inbound {}, skipping this cycle: {}", msg.id, e);
            return Ok(false);
        }
        debug!("Claimed inbound {}", msg.id);

        let dispatcher = dispatcher.clone();
        let id = msg.id;
        inflight.spawn(async move {
            match dispatcher.dispatch(msg.payload).await {
                Ok(DispatchOutcome::Duplicate) => debug!("Inbound {} was a duplicate", id),
                Ok(outcome) => debug!("Inbound {} handled: {:?}", id, outcome),
                Err(e) => error!("Dispatch of inbound {} failed: {:#}", id, e),
            }
        });
        Ok(true)
    }

    async fn set_aside_unroutable(&self, queue: &DurableQueue, registry: &ChannelRegistry) {
        match outbound::set_aside_unroutable(queue, registry).await {
            Ok(0) => {}
            Ok(n) => warn!("Moved {} undeliverable outbound message(s) to errors", n),
            Err(e) => error!("Outbound sweep failed: {}", e),
        }
    }
}

/// Queue a heartbeat for every agent whose interval elapsed at `now` and
/// whose active hours contain `wall`. Agents outside their window stay due.
pub(crate) async fn fire_heartbeats(
    config: &Config,
    queue: &DurableQueue,
    tracker: &mut HeartbeatTracker,
    now: Instant,
    wall: DateTime<Utc>,
) {
    for agent in &config.agents {
        let (Some(hb), Some(interval)) = (&agent.heartbeat, agent.heartbeat_interval()) else {
            continue;
        };
        if !tracker.is_due(&agent.id, interval, now) {
            continue;
        }
        if !heartbeat::within_active_hours(hb.active_hours.as_ref(), wall) {
            continue;
        }
        let prompt = heartbeat::read_prompt(agent.heartbeat_prompt_path().as_deref()).await;
        match queue.write(&heartbeat::heartbeat_message(&agent.id, prompt)).await {
            Ok(id) => {
                info!("[{}] Heartbeat queued ({})", agent.id, id);
                tracker.mark_fired(&agent.id, now);
            }
            Err(e) => error!("[{}] Failed to queue heartbeat: {}", agent.id, e),
        }
    }
}

pub fn crash_guard_for(config: &Config, paths: &DataPaths) -> CrashGuard {
    CrashGuard::new(
        paths.crash_log(),
        config.crash_guard.max_crashes,
        Duration::from_secs(config.crash_guard.window_secs),
    )
}

async fn discard<T>(handle: tokio::task::JoinHandle<T>) {
    let _ = handle.await;
}

#[cfg(test)]
mod tests;

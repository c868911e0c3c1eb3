// Stream supervisor: owns one pipeline per configured stream and applies
// lifecycle commands (reload, drain, stop, status) to them.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{Config, StreamConfig};
use crate::error::RelayError;
use crate::health::{HealthReport, PipelineState, StreamHealthReport};
use crate::hls::{Origin, PlaylistSnapshot};
use crate::pipeline::{PipelineOutputs, StreamPipeline};

/// Lifecycle commands consumed by the supervisor task.
#[derive(Debug)]
pub enum SupervisorCommand {
    Reload {
        config: Arc<Config>,
        reply: Option<oneshot::Sender<ReloadSummary>>,
    },
    Drain {
        timeout: Duration,
        reply: oneshot::Sender<ShutdownReport>,
    },
    Stop {
        reply: oneshot::Sender<ShutdownReport>,
    },
    Status {
        reply: oneshot::Sender<HealthReport>,
    },
}

/// What a reload changed, by stream name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Old pipelines cut short by a concurrent stop. Nothing was started
    /// in their place.
    pub interrupted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: Vec<String>,
    /// Streams that did not stop within the drain timeout and were killed.
    pub forced: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// Runtime handle for one stream's pipeline.
pub struct PipelineHandle {
    pub config: Arc<StreamConfig>,
    pub generation: u64,
    outputs: PipelineOutputs,
    drain: CancellationToken,
    kill: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn playlist(&self) -> Arc<PlaylistSnapshot> {
        self.outputs.playlist.borrow().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.outputs.status.borrow().failed || self.task_died()
    }

    /// The task ended without publishing `Stopped`, which only a panic does.
    fn task_died(&self) -> bool {
        self.task.as_ref().is_some_and(JoinHandle::is_finished)
            && self.outputs.status.borrow().state != PipelineState::Stopped
    }

    fn report(&self) -> StreamHealthReport {
        let mut status = self.outputs.status.borrow().clone();
        if self.task_died() {
            status.state = PipelineState::Stopped;
            status.failed = true;
            status.record_error(&RelayError::internal("pipeline task exited unexpectedly"));
        }
        let state = if self.drain.is_cancelled() && status.state != PipelineState::Stopped {
            PipelineState::Draining
        } else {
            status.state
        };
        StreamHealthReport {
            name: self.config.name.clone(),
            generation: self.generation,
            state,
            health: status.health(),
            cursor: status.cursor,
            window_len: status.window_len,
            last_error: status.last_error,
            last_error_category: status.last_error_category,
            last_success: status.last_success,
            ended: status.ended,
        }
    }

    /// Stop new cycles and hand over the task for awaiting.
    fn begin_drain(&mut self) -> Option<PendingStop> {
        self.drain.cancel();
        self.task.take().map(|task| PendingStop {
            name: self.config.name.clone(),
            task,
            kill: self.kill.clone(),
        })
    }

    fn begin_kill(&mut self) -> Option<PendingStop> {
        self.kill.cancel();
        self.begin_drain()
    }
}

struct PendingStop {
    name: String,
    task: JoinHandle<()>,
    kill: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOutcome {
    /// Finished its in-flight cycle.
    Drained,
    /// Its kill token fired before it finished.
    Killed,
    /// Still running at the deadline, then killed.
    Forced,
}

/// Wait for pipelines to stop. With a `deadline`, whatever is still running
/// when it passes is killed; without one this waits as long as the cycles
/// take, unless a stop cancels the kill tokens.
async fn await_stops(
    stops: Vec<PendingStop>,
    deadline: Option<Duration>,
) -> Vec<(String, StopOutcome)> {
    let mut results = join_all(stops.into_iter().map(|stop| async move {
        let PendingStop {
            name,
            mut task,
            kill,
        } = stop;
        let joined = match deadline {
            Some(limit) => tokio::time::timeout(limit, &mut task).await.ok(),
            None => Some((&mut task).await),
        };
        let outcome = match joined {
            Some(joined) => {
                if let Err(e) = joined {
                    error!(stream = %name, error = %e, "Pipeline task panicked");
                }
                if kill.is_cancelled() {
                    StopOutcome::Killed
                } else {
                    StopOutcome::Drained
                }
            }
            None => {
                let limit_ms = deadline.map_or(0, |d| d.as_millis() as u64);
                warn!(stream = %name, timeout_ms = limit_ms, "Drain timed out, killing pipeline");
                kill.cancel();
                if let Err(e) = task.await {
                    error!(stream = %name, error = %e, "Pipeline task panicked");
                }
                StopOutcome::Forced
            }
        };
        (name, outcome)
    }))
    .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

fn shutdown_report(outcomes: Vec<(String, StopOutcome)>) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for (name, outcome) in outcomes {
        match outcome {
            StopOutcome::Forced => report.forced.push(name),
            StopOutcome::Drained | StopOutcome::Killed => report.drained.push(name),
        }
    }
    report
}

pub struct StreamSupervisor {
    origin: Arc<dyn Origin>,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
    active: parking_lot::RwLock<Arc<Config>>,
    next_generation: AtomicU64,
    /// Parent of every pipeline's kill token. Cancelled once, by a stop.
    shutdown: CancellationToken,
}

impl StreamSupervisor {
    pub fn new(origin: Arc<dyn Origin>) -> Arc<Self> {
        Arc::new(Self {
            origin,
            pipelines: Mutex::new(HashMap::new()),
            active: parking_lot::RwLock::new(Arc::new(Config::default())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// The configuration most recently applied.
    pub fn active_config(&self) -> Arc<Config> {
        self.active.read().clone()
    }

    fn start_pipeline(&self, config: Arc<StreamConfig>) -> PipelineHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (pipeline, outputs) = StreamPipeline::new(config.clone(), self.origin.clone());
        let drain = CancellationToken::new();
        let kill = self.shutdown.child_token();
        let span = info_span!("pipeline", generation);
        let task = tokio::spawn(pipeline.run(drain.clone(), kill.clone()).instrument(span));
        info!(stream = %config.name, generation, "Started pipeline");
        PipelineHandle {
            config,
            generation,
            outputs,
            drain,
            kill,
            task: Some(task),
        }
    }

    /// Bring the running pipelines in line with `config`.
    ///
    /// Changed, failed and removed streams are drained first; their old
    /// handles stay visible until they have stopped. Replacements are
    /// published afterwards, so a stream never has two pipelines at once.
    /// In-flight cycles are always allowed to finish; only a stop cuts them
    /// short, and then no replacements are started.
    pub async fn apply(&self, config: Arc<Config>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut stops = Vec::new();
        let mut to_start: Vec<Arc<StreamConfig>> = Vec::new();

        {
            let mut pipelines = self.pipelines.lock().await;
            for (name, handle) in pipelines.iter_mut() {
                match config.stream(name) {
                    None => {
                        summary.removed.push(name.clone());
                        stops.extend(handle.begin_drain());
                    }
                    Some(new_config)
                        if **new_config != *handle.config
                            || handle.is_failed()
                            || handle.task.is_none() =>
                    {
                        summary.restarted.push(name.clone());
                        stops.extend(handle.begin_drain());
                        to_start.push(new_config.clone());
                    }
                    Some(_) => summary.unchanged.push(name.clone()),
                }
            }
            for (name, stream) in &config.streams {
                if !pipelines.contains_key(name) {
                    summary.started.push(name.clone());
                    to_start.push(stream.clone());
                }
            }
        }

        summary.interrupted = await_stops(stops, None)
            .await
            .into_iter()
            .filter(|(_, outcome)| *outcome == StopOutcome::Killed)
            .map(|(name, _)| name)
            .collect();

        let stopping = self.shutdown.is_cancelled();
        {
            let mut pipelines = self.pipelines.lock().await;
            for name in &summary.removed {
                pipelines.remove(name);
            }
            if !stopping {
                for stream in to_start {
                    let handle = self.start_pipeline(stream);
                    pipelines.insert(handle.config.name.clone(), handle);
                }
            }
        }
        if stopping {
            warn!(interrupted = ?summary.interrupted, "Reload interrupted by stop");
            summary.started.clear();
            summary.restarted.clear();
            return summary;
        }

        *self.active.write() = config;
        summary.started.sort();
        summary.restarted.sort();
        summary.removed.sort();
        summary.unchanged.sort();
        info!(
            started = summary.started.len(),
            restarted = summary.restarted.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged.len(),
            "Configuration applied"
        );
        summary
    }

    /// Stop new cycles everywhere and wait for in-flight cycles to finish.
    pub async fn drain_all(&self, timeout: Duration) -> ShutdownReport {
        let stops: Vec<_> = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines
                .values_mut()
                .filter_map(PipelineHandle::begin_drain)
                .collect()
        };
        info!(pipelines = stops.len(), timeout_ms = timeout.as_millis() as u64, "Draining");
        let report = shutdown_report(await_stops(stops, Some(timeout)).await);
        if !report.is_clean() {
            warn!(streams = ?report.forced, "Streams did not drain cleanly");
        }
        report
    }

    /// Abort everything, including in-flight fetches. Terminal: later
    /// reloads start nothing.
    pub async fn stop_all(&self) -> ShutdownReport {
        self.shutdown.cancel();
        let stops: Vec<_> = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines
                .values_mut()
                .filter_map(PipelineHandle::begin_kill)
                .collect()
        };
        // Killed pipelines exit promptly; the bound only guards a wedged task.
        shutdown_report(await_stops(stops, Some(Duration::from_secs(5))).await)
    }

    pub async fn health(&self) -> HealthReport {
        let pipelines = self.pipelines.lock().await;
        let mut streams: Vec<_> = pipelines.values().map(PipelineHandle::report).collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        HealthReport::new(streams)
    }

    pub async fn playlist(&self, name: &str) -> Option<Arc<PlaylistSnapshot>> {
        self.pipelines.lock().await.get(name).map(PipelineHandle::playlist)
    }

    /// Spawn the command loop. It runs until every [`SupervisorHandle`] is
    /// dropped.
    pub fn spawn(self: &Arc<Self>, buffer: usize) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move { supervisor.command_loop(rx).await });
        let handle = SupervisorHandle {
            tx,
            shutdown: self.shutdown.clone(),
        };
        (handle, task)
    }

    async fn command_loop(&self, mut rx: mpsc::Receiver<SupervisorCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SupervisorCommand::Reload { config, reply } => {
                    let summary = self.apply(config).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(summary);
                    }
                }
                SupervisorCommand::Drain { timeout, reply } => {
                    let _ = reply.send(self.drain_all(timeout).await);
                }
                SupervisorCommand::Stop { reply } => {
                    let _ = reply.send(self.stop_all().await);
                }
                SupervisorCommand::Status { reply } => {
                    let _ = reply.send(self.health().await);
                }
            }
        }
        debug!("Supervisor command channel closed");
    }
}

/// Cloneable sender side of the supervisor's command channel.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
    shutdown: CancellationToken,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RelayError::internal("supervisor is not running"))?;
        reply_rx
            .await
            .map_err(|_| RelayError::internal("supervisor dropped the reply"))
    }

    pub async fn reload(&self, config: Arc<Config>) -> Result<ReloadSummary, RelayError> {
        self.request(|reply| SupervisorCommand::Reload {
            config,
            reply: Some(reply),
        })
        .await
    }

    pub async fn drain(&self, timeout: Duration) -> Result<ShutdownReport, RelayError> {
        self.request(|reply| SupervisorCommand::Drain { timeout, reply })
            .await
    }

    /// Kill every pipeline. The kill lands immediately, even while the
    /// supervisor is still busy with an earlier reload or drain.
    pub async fn stop(&self) -> Result<ShutdownReport, RelayError> {
        self.shutdown.cancel();
        self.request(|reply| SupervisorCommand::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<HealthReport, RelayError> {
        self.request(|reply| SupervisorCommand::Status { reply })
            .await
    }
}

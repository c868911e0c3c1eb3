//! Process-level control: turns OS signals into supervisor commands.

use dubreamer_engine::config::LoadedConfig;
use dubreamer_engine::hls::Origin;
use dubreamer_engine::{
    Config, ConfigLoader, RelayError, ReloadSummary, ShutdownReport, StreamSupervisor,
    SupervisorHandle,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::logging::ReopenableLogFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    User1,
    User2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Kill every pipeline and exit.
    Stop,
    /// Let in-flight cycles finish, then exit.
    Drain,
    Reload,
    ReopenLog,
    Unsupported,
}

pub fn action_for(signal: ProcessSignal) -> SignalAction {
    match signal {
        ProcessSignal::Interrupt | ProcessSignal::Terminate => SignalAction::Stop,
        ProcessSignal::Quit => SignalAction::Drain,
        ProcessSignal::Hangup => SignalAction::Reload,
        ProcessSignal::User1 => SignalAction::ReopenLog,
        ProcessSignal::User2 => SignalAction::Unsupported,
    }
}

/// Whether `next` may cut short the handling of `current`. Stop beats
/// everything but another stop; drain beats reloads and log rotation.
fn preempts(current: SignalAction, next: SignalAction) -> bool {
    match next {
        SignalAction::Stop => current != SignalAction::Stop,
        SignalAction::Drain => !matches!(current, SignalAction::Stop | SignalAction::Drain),
        SignalAction::Reload | SignalAction::ReopenLog | SignalAction::Unsupported => false,
    }
}

enum Handled {
    Done(ControlFlow),
    Preempted(ProcessSignal),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Exit(ShutdownReport),
}

pub struct ProcessController {
    loader: ConfigLoader,
    debug: bool,
    log_file: Option<ReopenableLogFile>,
    supervisor: Arc<StreamSupervisor>,
    handle: SupervisorHandle,
    task: JoinHandle<()>,
    config: Arc<Config>,
}

impl ProcessController {
    /// Spawn the supervisor and start every stream in `initial`.
    pub async fn start(
        loader: ConfigLoader,
        initial: LoadedConfig,
        origin: Arc<dyn Origin>,
        debug: bool,
        log_file: Option<ReopenableLogFile>,
    ) -> Result<Self, RelayError> {
        let supervisor = StreamSupervisor::new(origin);
        let config = Arc::new(initial.config);
        let (handle, task) = supervisor.spawn(config.supervisor.command_buffer);

        let summary = handle.reload(config.clone()).await?;
        info!(
            path = %initial.path.display(),
            streams = summary.started.len(),
            "Relay started"
        );

        Ok(Self {
            loader,
            debug,
            log_file,
            supervisor,
            handle,
            task,
            config,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<StreamSupervisor> {
        &self.supervisor
    }

    pub fn dump_config(&self) {
        if self.debug {
            info!("Resolved configuration: {:#?}", self.config);
        }
    }

    /// Re-read the configuration file and hand it to the supervisor. On any
    /// load error the running configuration is left untouched.
    pub async fn reload(&mut self) -> Result<ReloadSummary, RelayError> {
        let loaded = self.loader.load()?;
        let config = Arc::new(loaded.config);

        if config.port != self.config.port || config.hostname != self.config.hostname {
            warn!(
                port = config.port,
                hostname = %config.hostname,
                "Listener address changes take effect after a restart"
            );
        }
        if config.uses_default_credentials() {
            warn!("Reloaded configuration uses the default credentials");
        }

        let summary = self.handle.reload(config.clone()).await?;
        self.config = config;
        self.dump_config();
        info!(
            path = %loaded.path.display(),
            started = ?summary.started,
            restarted = ?summary.restarted,
            removed = ?summary.removed,
            "Configuration reloaded"
        );
        Ok(summary)
    }

    pub async fn handle_signal(&mut self, signal: ProcessSignal) -> ControlFlow {
        match action_for(signal) {
            SignalAction::Stop => {
                info!(?signal, "Stopping immediately");
                let report = self.handle.stop().await.unwrap_or_else(|e| {
                    error!(error = %e, "Supervisor unavailable during stop");
                    ShutdownReport::default()
                });
                ControlFlow::Exit(report)
            }
            SignalAction::Drain => {
                let timeout = self.config.supervisor.drain_timeout;
                info!(timeout_secs = timeout.as_secs(), "Draining before exit");
                let report = self.handle.drain(timeout).await.unwrap_or_else(|e| {
                    error!(error = %e, "Supervisor unavailable during drain");
                    ShutdownReport::default()
                });
                if report.is_clean() {
                    info!(streams = report.drained.len(), "All streams drained");
                } else {
                    warn!(streams = ?report.forced, "Killed streams that missed the drain timeout");
                }
                ControlFlow::Exit(report)
            }
            SignalAction::Reload => {
                info!("Reloading configuration");
                if let Err(e) = self.reload().await {
                    error!(error = %e, "Reload failed, keeping the previous configuration");
                }
                ControlFlow::Continue
            }
            SignalAction::ReopenLog => {
                match &self.log_file {
                    Some(file) => match file.reopen() {
                        Ok(()) => info!(path = %file.path().display(), "Log file reopened"),
                        Err(e) => error!(error = %e, "Failed to reopen log file"),
                    },
                    None => warn!("No log file to reopen"),
                }
                ControlFlow::Continue
            }
            SignalAction::Unsupported => {
                warn!(?signal, "Binary upgrade is not supported, ignoring signal");
                ControlFlow::Continue
            }
        }
    }

    /// Dispatch OS signals until one of them ends the process.
    pub async fn run(mut self) -> std::io::Result<ShutdownReport> {
        let report = self.dispatch(SignalListener::new()?).await;
        self.shutdown().await;
        Ok(report)
    }

    /// Handle signals in arrival order. A stop or drain that arrives while an
    /// earlier signal is still being handled abandons it; anything else is
    /// queued behind it.
    async fn dispatch(&mut self, mut signals: impl SignalSource) -> ShutdownReport {
        let mut queued = VecDeque::new();
        let mut next = None;
        loop {
            let signal = match next.take().or_else(|| queued.pop_front()) {
                Some(signal) => signal,
                None => signals.recv().await.unwrap_or(ProcessSignal::Terminate),
            };
            let handled = tokio::select! {
                flow = self.handle_signal(signal) => Handled::Done(flow),
                preempting = next_preempting(&mut signals, &mut queued, action_for(signal)) => {
                    Handled::Preempted(preempting)
                }
            };
            match handled {
                Handled::Done(ControlFlow::Exit(report)) => return report,
                Handled::Done(ControlFlow::Continue) => {}
                Handled::Preempted(preempting) => {
                    warn!(?signal, by = ?preempting, "Signal handling preempted");
                    next = Some(preempting);
                }
            }
        }
    }

    async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.task.await {
            error!(error = %e, "Supervisor task ended abnormally");
        }
    }
}

/// Wait for signals that may cut short the handling of `current`, queueing
/// the rest.
async fn next_preempting(
    signals: &mut impl SignalSource,
    queued: &mut VecDeque<ProcessSignal>,
    current: SignalAction,
) -> ProcessSignal {
    loop {
        let Some(signal) = signals.recv().await else {
            return std::future::pending().await;
        };
        if preempts(current, action_for(signal)) {
            return signal;
        }
        queued.push_back(signal);
    }
}

trait SignalSource {
    /// `None` once no further signals can arrive.
    async fn recv(&mut self) -> Option<ProcessSignal>;
}

#[cfg(unix)]
struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
    user2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
        })
    }
}

#[cfg(unix)]
impl SignalSource for SignalListener {
    async fn recv(&mut self) -> Option<ProcessSignal> {
        tokio::select! {
            s = self.interrupt.recv() => s.map(|_| ProcessSignal::Interrupt),
            s = self.terminate.recv() => s.map(|_| ProcessSignal::Terminate),
            s = self.quit.recv() => s.map(|_| ProcessSignal::Quit),
            s = self.hangup.recv() => s.map(|_| ProcessSignal::Hangup),
            s = self.user1.recv() => s.map(|_| ProcessSignal::User1),
            s = self.user2.recv() => s.map(|_| ProcessSignal::User2),
        }
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }
}

#[cfg(not(unix))]
impl SignalSource for SignalListener {
    async fn recv(&mut self) -> Option<ProcessSignal> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|_| ProcessSignal::Interrupt)
    }
}

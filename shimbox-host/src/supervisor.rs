//! Guest process lifecycle
//!
//! ```text
//!   Created ──► Initializing ──► Launched ──► Running ──┬──► Exited   (exit code 0)
//!                    │               │                  └──► Failed   (non-zero, killed, fault)
//!                    └───────────────┴─────────────────────► Failed   (channel or launch error)
//! ```
//!
//! Initialization binds the channel once, under the init lock; launching
//! again or concurrently is refused. After launch a monitor task owns the
//! guest process. It waits for the exit, a terminate request from the host
//! or a critical report from the guest, flushes the snapshot when
//! configured and publishes the terminal state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::channel::{ChannelError, ChannelServer, GuestEvent};
use crate::config::HostContext;
use crate::launcher::{GuestProcess, Injector, LaunchError, LaunchRequest};

/// What kind of binary a descriptor points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableKind {
    NativeExecutable,
    /// Runs on a managed runtime and needs a wrapper process
    ManagedExecutable,
    Library,
    Other,
}

impl ExecutableKind {
    /// Whether a guest can be started from this kind
    pub fn is_executable(self) -> bool {
        matches!(self, Self::NativeExecutable | Self::ManagedExecutable)
    }
}

/// The binary to virtualize and how to start it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableDescriptor {
    pub path: PathBuf,
    pub kind: ExecutableKind,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ExecutableDescriptor {
    pub fn new(path: impl Into<PathBuf>, kind: ExecutableKind) -> Self {
        Self {
            path: path.into(),
            kind,
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn native(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ExecutableKind::NativeExecutable)
    }

    pub fn managed(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ExecutableKind::ManagedExecutable)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Why a guest ended in [`ProcessState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The guest exited with a non-zero code
    ExitCode(i32),
    /// The channel could not be set up
    Initialization(String),
    /// Starting or injecting the guest failed
    Launch(String),
    /// The host killed the guest
    TerminatedByHost,
    /// The guest reported a fatal condition and was killed
    GuestFault(String),
    /// The exit status could not be collected
    Lost(String),
}

/// Lifecycle state of a supervised guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Initializing,
    Launched,
    Running,
    Exited,
    Failed(FailureCause),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launched | Self::Running)
    }
}

/// Error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{path} is not a valid executable ({kind:?})")]
    InvalidExecutable { path: PathBuf, kind: ExecutableKind },

    #[error("The guest has already been started")]
    AlreadyStarted,

    #[error("The guest has not been started")]
    NotStarted,

    #[error("The guest is not running (state {0:?})")]
    NotRunning(ProcessState),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Guarded by the init lock
struct Setup {
    channel: Option<ChannelServer>,
    kill_rx: Option<mpsc::UnboundedReceiver<()>>,
}

/// Starts one guest and tracks it until it ends
pub struct GuestProcessSupervisor {
    descriptor: ExecutableDescriptor,
    context: HostContext,
    injector: Arc<dyn Injector>,
    setup: Mutex<Setup>,
    state: Arc<watch::Sender<ProcessState>>,
    kill_tx: mpsc::UnboundedSender<()>,
    /// Set once `launch` is entered; every launch ends Running or terminal
    launched: AtomicBool,
    process_id: OnceLock<u32>,
}

impl GuestProcessSupervisor {
    /// Supervisor for `descriptor`; only native and managed executables are accepted
    pub fn new(
        descriptor: ExecutableDescriptor,
        context: HostContext,
        injector: impl Injector + 'static,
    ) -> Result<Self, SupervisorError> {
        Self::with_injector(descriptor, context, Arc::new(injector))
    }

    pub fn with_injector(
        descriptor: ExecutableDescriptor,
        context: HostContext,
        injector: Arc<dyn Injector>,
    ) -> Result<Self, SupervisorError> {
        if !descriptor.kind.is_executable() {
            return Err(SupervisorError::InvalidExecutable {
                path: descriptor.path,
                kind: descriptor.kind,
            });
        }

        let (state, _) = watch::channel(ProcessState::Created);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        Ok(Self {
            descriptor,
            context,
            injector,
            setup: Mutex::new(Setup {
                channel: None,
                kill_rx: Some(kill_rx),
            }),
            state: Arc::new(state),
            kill_tx,
            launched: AtomicBool::new(false),
            process_id: OnceLock::new(),
        })
    }

    /// Construct and launch in one step
    pub async fn start(
        descriptor: ExecutableDescriptor,
        context: HostContext,
        injector: impl Injector + 'static,
    ) -> Result<Self, SupervisorError> {
        let supervisor = Self::new(descriptor, context, injector)?;
        supervisor.launch().await?;
        Ok(supervisor)
    }

    pub fn descriptor(&self) -> &ExecutableDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Receiver notified on state changes
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// OS identifier of the guest once launched
    pub fn process_id(&self) -> Option<u32> {
        self.process_id.get().copied()
    }

    /// Bind the channel; later calls return the same channel name
    pub async fn initialize(&self) -> Result<String, SupervisorError> {
        let mut setup = self.setup.lock().await;
        self.ensure_channel(&mut setup).await
    }

    /// Initialize if needed, then start the guest and arm exit monitoring
    ///
    /// Returns the guest's process identifier.
    pub async fn launch(&self) -> Result<u32, SupervisorError> {
        let mut setup = self.setup.lock().await;
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted);
        }

        if self.descriptor.kind == ExecutableKind::ManagedExecutable {
            let error = LaunchError::Unsupported(
                "virtualizing a managed executable requires a wrapper process".into(),
            );
            self.transition(ProcessState::Failed(FailureCause::Launch(error.to_string())));
            return Err(error.into());
        }

        let channel_name = self.ensure_channel(&mut setup).await?;

        let request = LaunchRequest {
            executable: self.descriptor.path.clone(),
            args: self.descriptor.args.clone(),
            working_dir: self.descriptor.working_dir.clone(),
            channel_name,
            interception_library: self.context.config.interception_library.clone(),
            env: Vec::new(),
        };

        let process = match self.injector.create_and_inject(&request).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(
                    injector = self.injector.name(),
                    executable = %self.descriptor.path.display(),
                    error = %e,
                    "Failed to launch guest"
                );
                self.transition(ProcessState::Failed(FailureCause::Launch(e.to_string())));
                return Err(e.into());
            }
        };

        let pid = process.id();
        let _ = self.process_id.set(pid);
        self.transition(ProcessState::Launched);
        tracing::info!(
            pid,
            executable = %self.descriptor.path.display(),
            "Virtualized process created"
        );

        // Must precede the monitor, which publishes the terminal state
        self.transition(ProcessState::Running);
        let events = setup.channel.as_mut().and_then(|c| c.take_events());
        let kill_rx = setup.kill_rx.take();
        tokio::spawn(monitor(
            process,
            kill_rx,
            events,
            Arc::clone(&self.state),
            self.context.clone(),
        ));
        Ok(pid)
    }

    /// Kill the running guest and wait for it to end
    ///
    /// The guest ends in [`ProcessState::Failed`] with
    /// [`FailureCause::TerminatedByHost`].
    pub async fn terminate(&self) -> Result<ProcessState, SupervisorError> {
        let state = self.state();
        if !state.is_active() {
            return Err(SupervisorError::NotRunning(state));
        }
        tracing::info!(pid = ?self.process_id(), "Terminating guest");
        let _ = self.kill_tx.send(());
        self.wait_for_exit().await
    }

    /// Wait until the guest reaches a terminal state
    ///
    /// Fails with [`SupervisorError::NotStarted`] until `launch` has been
    /// called; an initialized but unlaunched supervisor never ends.
    pub async fn wait_for_exit(&self) -> Result<ProcessState, SupervisorError> {
        let mut rx = self.state.subscribe();
        if !self.launched.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotStarted);
        }
        let state = match rx.wait_for(ProcessState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        Ok(state)
    }

    /// Close the channel; guests can no longer reach the stores
    pub async fn close(&self) {
        let mut setup = self.setup.lock().await;
        if let Some(mut channel) = setup.channel.take() {
            channel.shutdown().await;
        }
    }

    async fn ensure_channel(&self, setup: &mut Setup) -> Result<String, SupervisorError> {
        if let Some(channel) = &setup.channel {
            return Ok(channel.channel_name());
        }

        self.transition(ProcessState::Initializing);
        match ChannelServer::bind(self.context.clone()).await {
            Ok(channel) => {
                let name = channel.channel_name();
                setup.channel = Some(channel);
                Ok(name)
            }
            Err(e) => {
                self.transition(ProcessState::Failed(FailureCause::Initialization(
                    e.to_string(),
                )));
                Err(e.into())
            }
        }
    }

    fn transition(&self, next: ProcessState) {
        publish(&self.state, next);
    }
}

impl std::fmt::Debug for GuestProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestProcessSupervisor")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .field("process_id", &self.process_id())
            .finish_non_exhaustive()
    }
}

fn publish(state: &watch::Sender<ProcessState>, next: ProcessState) {
    let previous = state.send_replace(next.clone());
    if previous != next {
        tracing::debug!(from = ?previous, to = ?next, "Guest state changed");
    }
}

enum Outcome {
    Exited(Result<i32, LaunchError>),
    Kill(FailureCause),
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<GuestEvent>>) -> Option<GuestEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn monitor(
    mut process: Box<dyn GuestProcess>,
    mut kill_rx: Option<mpsc::UnboundedReceiver<()>>,
    mut events: Option<mpsc::UnboundedReceiver<GuestEvent>>,
    state: Arc<watch::Sender<ProcessState>>,
    context: HostContext,
) {
    let pid = process.id();

    let outcome = loop {
        let outcome = tokio::select! {
            code = process.wait() => Some(Outcome::Exited(code)),
            Some(()) = async {
                match kill_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => Some(Outcome::Kill(FailureCause::TerminatedByHost)),
            Some(event) = next_event(&mut events) => match event {
                GuestEvent::Critical { message, .. } => {
                    Some(Outcome::Kill(FailureCause::GuestFault(message)))
                }
                other => {
                    tracing::debug!(pid, event = ?other, "Guest channel event");
                    None
                }
            },
        };
        if let Some(outcome) = outcome {
            break outcome;
        }
    };

    let terminal = match outcome {
        Outcome::Exited(Ok(0)) => ProcessState::Exited,
        Outcome::Exited(Ok(code)) => ProcessState::Failed(FailureCause::ExitCode(code)),
        Outcome::Exited(Err(e)) => ProcessState::Failed(FailureCause::Lost(e.to_string())),
        Outcome::Kill(cause) => {
            if let Err(e) = process.kill().await {
                tracing::warn!(pid, error = %e, "Failed to kill guest");
            }
            ProcessState::Failed(cause)
        }
    };

    match &terminal {
        ProcessState::Exited => tracing::info!(pid, "Virtualized process exited"),
        ProcessState::Failed(cause) => tracing::warn!(pid, cause = ?cause, "Virtualized process failed"),
        _ => {}
    }

    if context.config.flush_on_exit {
        let flushing = context.clone();
        match tokio::task::spawn_blocking(move || flushing.flush_snapshot()).await {
            Ok(Ok(true)) => tracing::debug!(pid, "Snapshot flushed on exit"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::error!(pid, error = %e, "Failed to flush snapshot"),
            Err(e) => tracing::error!(pid, error = %e, "Snapshot flush task failed"),
        }
    }

    publish(&state, terminal);
}

//! One supervisor per configured client: connect, run, classify how the
//! run ended, back off and reconnect.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    tokio::{
        sync::{mpsc, oneshot, watch},
        task::{AbortHandle, JoinHandle},
    },
    tracing::{debug, error, info, warn},
};

use {
    warden_config::{ClientConfig, ConfigHandle},
    warden_extensions::{
        CallbackTasks, ClientControl, ClientHandle, ContextKey, Error as ExtensionError,
        ExtensionRegistry, Scope,
    },
    warden_protocol::{Connection, ConnectionEnd, DialParams, Dialer, HandoffState},
};

use crate::{
    backoff::Backoff,
    error::Result,
    host::HostLink,
    pump::pump,
};

/// How long `prepare_handoff` waits for the run loop to package.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Running,
    Failed,
    Restarting,
    HandingOff,
    Stopping,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Restarting => "restarting",
            Self::HandingOff => "handing_off",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Collaborators every supervisor needs.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub dialer: Arc<dyn Dialer>,
    pub registry: Arc<ExtensionRegistry>,
    pub config: ConfigHandle,
    pub host: HostLink,
}

enum Control {
    Stop { reason: String },
    Restart { reason: String },
    Handoff { reply: oneshot::Sender<Option<HandoffState>> },
}

pub(crate) struct Shared {
    name: String,
    /// True only while the run loop is blocked on a live connection.
    can_signal: AtomicBool,
    restart_pending: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    pub(crate) state: watch::Sender<SupervisorState>,
    abort: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(client = %self.name, from = %previous, to = %state, "supervisor state");
        }
    }
}

/// Cheap handle onto a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    pub fn can_signal(&self) -> bool {
        self.shared.can_signal.load(Ordering::SeqCst)
    }

    /// Close and reopen the connection without backoff. Returns `false`
    /// unless the supervisor is running and no restart is already pending.
    pub fn restart(&self, reason: &str) -> bool {
        if !self.can_signal() || self.shared.restart_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let sent = self
            .shared
            .control
            .send(Control::Restart {
                reason: reason.to_string(),
            })
            .is_ok();
        if !sent {
            self.shared.restart_pending.store(false, Ordering::SeqCst);
        }
        sent
    }

    /// Quit and terminate. Outside `Running` the task is killed outright
    /// and extension cleanup is skipped.
    pub fn stop(&self, reason: &str) {
        if self.can_signal() {
            let request = Control::Stop {
                reason: reason.to_string(),
            };
            if self.shared.control.send(request).is_ok() {
                return;
            }
        }
        self.terminate();
    }

    /// Kill the run task.
    pub fn terminate(&self) {
        let abort = self.shared.abort.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(abort) = abort.as_ref() {
            warn!(client = %self.name(), "terminating supervisor task");
            abort.abort();
        }
    }

    /// Ask the run loop to package its connection for a new process image.
    /// `None` when the supervisor is not running or packaging failed; the
    /// supervisor terminates either way once this returns `Some`.
    pub async fn prepare_handoff(&self) -> Option<HandoffState> {
        if !self.can_signal() {
            return None;
        }
        let (reply, response) = oneshot::channel();
        self.shared.control.send(Control::Handoff { reply }).ok()?;
        match tokio::time::timeout(HANDOFF_TIMEOUT, response).await {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(client = %self.name(), "timed out waiting for handoff package");
                self.terminate();
                None
            },
        }
    }

    /// Resolves once the supervisor has terminated.
    pub async fn wait(&self) {
        let mut state = self.subscribe();
        // An error means the sender is gone, which only happens after exit.
        let _ = state.wait_for(|s| *s == SupervisorState::Terminated).await;
    }

    pub(crate) fn set_abort(&self, handle: AbortHandle) {
        *self.shared.abort.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

/// The [`ClientControl`] given to extensions running under a supervisor.
struct SupervisorControl {
    handle: SupervisorHandle,
    host: HostLink,
}

impl ClientControl for SupervisorControl {
    fn restart(&self, reason: &str) -> bool {
        self.handle.restart(reason)
    }

    fn request_handoff(&self) -> bool {
        self.host.request_handoff()
    }

    fn request_shutdown(&self, reason: &str) {
        self.host.request_shutdown(reason);
    }
}

/// How one run ended.
enum Exit {
    Closed(ConnectionEnd),
    Stop(String),
    Restart(String),
    Handoff(oneshot::Sender<Option<HandoffState>>),
}

pub(crate) struct Supervisor {
    handle: SupervisorHandle,
    deps: SupervisorDeps,
    resume: Option<HandoffState>,
    control: mpsc::UnboundedReceiver<Control>,
    backoff: Backoff,
}

fn dial_params(config: &ClientConfig) -> DialParams {
    DialParams {
        client: config.name.clone(),
        host: config.host.clone(),
        port: config.port,
        password: config.password.clone(),
        nick: config.nick.clone(),
        ident: config.ident.clone(),
        real_name: config.real_name.clone(),
    }
}

/// Stop the event pump and every callback it started.
async fn stop_pump(pump: JoinHandle<()>, callbacks: &CallbackTasks) {
    pump.abort();
    callbacks.close().await;
    let _ = pump.await;
}

impl Supervisor {
    pub(crate) fn new(
        name: &str,
        deps: SupervisorDeps,
        resume: Option<HandoffState>,
    ) -> (SupervisorHandle, Self) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SupervisorState::Idle);
        let handle = SupervisorHandle {
            shared: Arc::new(Shared {
                name: name.to_string(),
                can_signal: AtomicBool::new(false),
                restart_pending: AtomicBool::new(false),
                control: control_tx,
                state,
                abort: Mutex::new(None),
            }),
        };
        let supervisor = Self {
            handle: handle.clone(),
            deps,
            resume,
            control: control_rx,
            backoff: Backoff::new(),
        };
        (handle, supervisor)
    }

    fn name(&self) -> &str {
        self.handle.name()
    }

    fn key(&self) -> ContextKey {
        ContextKey::connection(self.name())
    }

    fn set_state(&self, state: SupervisorState) {
        self.handle.shared.set_state(state);
    }

    fn set_can_signal(&self, value: bool) {
        self.handle.shared.can_signal.store(value, Ordering::SeqCst);
    }

    pub(crate) async fn run(mut self) {
        // A forcibly terminated predecessor may have left instances behind.
        if let Err(e) = self.deps.registry.disable_within(&self.key()).await {
            error!(client = %self.name(), error = %e, "stale extension instances could not be removed");
            self.set_state(SupervisorState::Terminated);
            return;
        }

        loop {
            self.set_state(SupervisorState::Connecting);
            let config = match self.deps.config.client(self.name()) {
                Ok(config) => Arc::new(config),
                Err(e) => {
                    error!(client = %self.name(), error = %e, "cannot resolve client configuration, giving up");
                    break;
                },
            };

            let connection = match self.connect(&config).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(client = %self.name(), error = %e, "connection attempt failed");
                    if self.fail().await {
                        continue;
                    }
                    break;
                },
            };

            let client = ClientHandle {
                name: self.name().to_string(),
                connection: Arc::clone(&connection),
                control: Arc::new(SupervisorControl {
                    handle: self.handle.clone(),
                    host: self.deps.host.clone(),
                }),
                config,
            };
            // Subscribe before activation so nothing sent meanwhile is lost.
            let events = connection.subscribe();
            if let Err(e) = self.activate(&client).await {
                warn!(client = %self.name(), error = %e, "activation failed");
                let _ = connection.quit("Activation failed").await;
                if self.fail().await {
                    continue;
                }
                break;
            }

            let callbacks = Arc::new(CallbackTasks::new());
            let pump = tokio::spawn(pump(
                Arc::clone(&self.deps.registry),
                Arc::clone(&callbacks),
                client.clone(),
                events,
            ));
            self.backoff.reset();
            self.handle
                .shared
                .restart_pending
                .store(false, Ordering::SeqCst);
            self.set_state(SupervisorState::Running);
            self.set_can_signal(true);
            info!(client = %self.name(), identity = %connection.identity(), "running");

            let exit = tokio::select! {
                end = connection.closed() => Exit::Closed(end),
                control = self.control.recv() => match control {
                    Some(Control::Stop { reason }) => Exit::Stop(reason),
                    Some(Control::Restart { reason }) => Exit::Restart(reason),
                    Some(Control::Handoff { reply }) => Exit::Handoff(reply),
                    None => Exit::Stop("Supervisor released".to_string()),
                },
            };
            self.set_can_signal(false);

            match exit {
                Exit::Stop(reason) => {
                    self.set_state(SupervisorState::Stopping);
                    info!(client = %self.name(), %reason, "stopping");
                    if let Err(e) = connection.quit(&reason).await {
                        debug!(client = %self.name(), error = %e, "quit failed");
                    }
                    stop_pump(pump, &callbacks).await;
                    if let Err(e) = self.teardown().await {
                        error!(client = %self.name(), error = %e, "extension teardown failed");
                    }
                    break;
                },
                Exit::Restart(reason) => {
                    self.set_state(SupervisorState::Restarting);
                    info!(client = %self.name(), %reason, "restarting");
                    if let Err(e) = connection.quit(&reason).await {
                        debug!(client = %self.name(), error = %e, "quit failed");
                    }
                    stop_pump(pump, &callbacks).await;
                    if let Err(e) = self.teardown().await {
                        error!(client = %self.name(), error = %e, "extension teardown failed, giving up");
                        break;
                    }
                },
                Exit::Handoff(reply) => {
                    self.set_state(SupervisorState::HandingOff);
                    let packaged = match connection.prepare_handoff().await {
                        Ok(state) => Some(state),
                        Err(e) => {
                            warn!(client = %self.name(), error = %e, "connection could not be packaged");
                            None
                        },
                    };
                    stop_pump(pump, &callbacks).await;
                    if let Err(e) = self.teardown().await {
                        warn!(client = %self.name(), error = %e, "extension teardown failed during handoff");
                    }
                    if packaged.is_some() {
                        info!(client = %self.name(), "connection packaged for handoff");
                    }
                    let _ = reply.send(packaged);
                    break;
                },
                Exit::Closed(end) => {
                    warn!(client = %self.name(), ?end, "connection ended");
                    stop_pump(pump, &callbacks).await;
                    if !self.fail().await {
                        break;
                    }
                },
            }
        }
        self.set_state(SupervisorState::Terminated);
        info!(client = %self.name(), "supervisor terminated");
    }

    async fn connect(&mut self, config: &ClientConfig) -> Result<Arc<dyn Connection>> {
        let params = dial_params(config);
        if let Some(state) = self.resume.take() {
            match self.deps.dialer.resume(&params, state).await {
                Ok(connection) => {
                    info!(client = %self.name(), "resumed inherited connection");
                    return Ok(connection);
                },
                Err(e) => {
                    warn!(client = %self.name(), error = %e, "resume failed, dialing fresh");
                },
            }
        }
        info!(client = %self.name(), host = %params.host, port = params.port, "connecting");
        Ok(self.deps.dialer.dial(&params).await?)
    }

    /// Enable the configured extensions, then join the configured channels.
    async fn activate(&self, client: &ClientHandle) -> Result<()> {
        let registry = &self.deps.registry;
        let config = &client.config;
        for spec in &config.extensions {
            registry.load(&spec.name)?;
            let key = match registry.scope_of(&spec.name) {
                Some(Scope::Global) => ContextKey::Global,
                _ => self.key(),
            };
            registry
                .enable(&spec.name, key, Some(client), &spec.args)
                .await?;
        }
        for (channel, specs) in &config.channel_extensions {
            for spec in specs {
                registry.load(&spec.name)?;
                registry
                    .enable(
                        &spec.name,
                        ContextKey::channel(self.name(), channel),
                        Some(client),
                        &spec.args,
                    )
                    .await?;
            }
        }
        let joined = client.connection.channels();
        for channel in &config.channels {
            if !joined.iter().any(|c| c.eq_ignore_ascii_case(channel)) {
                client.connection.join(channel).await?;
            }
        }
        Ok(())
    }

    /// Disable every instance bound to this connection or its channels.
    async fn teardown(&self) -> std::result::Result<(), ExtensionError> {
        self.deps.registry.disable_within(&self.key()).await
    }

    /// Failure path: tear down, wait out the backoff. Returns whether to
    /// try again.
    async fn fail(&mut self) -> bool {
        self.set_state(SupervisorState::Failed);
        match self.teardown().await {
            Ok(()) => {},
            Err(e @ ExtensionError::Referenced { .. }) => {
                error!(client = %self.name(), error = %e, "extensions still referenced after failure, giving up");
                return false;
            },
            Err(e) => warn!(client = %self.name(), error = %e, "extension teardown failed"),
        }

        let delay = self.backoff.current();
        self.backoff.advance();
        info!(client = %self.name(), delay_secs = delay.as_secs_f64(), "reconnecting after backoff");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                control = self.control.recv() => match control {
                    Some(Control::Stop { reason }) => {
                        info!(client = %self.name(), %reason, "stopped while backing off");
                        return false;
                    },
                    Some(Control::Handoff { reply }) => {
                        let _ = reply.send(None);
                    },
                    Some(Control::Restart { .. }) => {},
                    None => return false,
                },
            }
        }
    }
}

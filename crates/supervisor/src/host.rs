//! Process-level orchestration: load extensions, start one supervisor per
//! client, and wait for shutdown, a handoff request, or for every
//! supervisor to finish.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    tokio::sync::{Mutex, mpsc},
    tracing::{error, info, warn},
};

use {
    warden_config::ConfigHandle,
    warden_extensions::{ContextKey, ExtensionRegistry},
    warden_protocol::Dialer,
};

use crate::{
    error::{Error, Result},
    handoff::{self, HandoffPackage},
    supervisor::SupervisorDeps,
    table::SupervisorTable,
};

/// Requests extensions make of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    Handoff,
    Shutdown { reason: String },
}

/// Sending side of the host's request queue, shared by all supervisors.
#[derive(Clone)]
pub struct HostLink {
    requests: mpsc::UnboundedSender<HostRequest>,
    handoff_pending: Arc<AtomicBool>,
}

impl HostLink {
    /// Returns `false` if a handoff was already requested.
    pub fn request_handoff(&self) -> bool {
        if self.handoff_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.requests.send(HostRequest::Handoff).is_ok()
    }

    pub fn request_shutdown(&self, reason: &str) {
        let _ = self.requests.send(HostRequest::Shutdown {
            reason: reason.to_string(),
        });
    }
}

/// Why [`Host::run`] returned.
#[derive(Debug)]
pub enum HostExit {
    /// Shutdown signal or request; every supervisor has stopped.
    Shutdown,
    /// No supervisor was left running.
    Idle,
    /// Connections were packaged; the caller should re-exec with them.
    HandedOff(HandoffPackage),
}

pub struct Host {
    config: ConfigHandle,
    registry: Arc<ExtensionRegistry>,
    dialer: Arc<dyn Dialer>,
    table: SupervisorTable,
    link: HostLink,
    requests: Mutex<mpsc::UnboundedReceiver<HostRequest>>,
}

impl Host {
    pub fn new(
        config: ConfigHandle,
        registry: Arc<ExtensionRegistry>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            dialer,
            table: SupervisorTable::new(),
            link: HostLink {
                requests: tx,
                handoff_pending: Arc::default(),
            },
            requests: Mutex::new(rx),
        }
    }

    pub fn table(&self) -> &SupervisorTable {
        &self.table
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn link(&self) -> HostLink {
        self.link.clone()
    }

    pub fn deps(&self) -> SupervisorDeps {
        SupervisorDeps {
            dialer: Arc::clone(&self.dialer),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            host: self.link(),
        }
    }

    /// Load and enable startup extensions, then start one supervisor per
    /// configured client, resuming inherited connections where possible.
    pub async fn start(&self, inherited: Option<HandoffPackage>) -> Result<()> {
        let config = self.config.snapshot();

        let names: Vec<String> = match &config.load_extensions {
            Some(names) => names.clone(),
            None => self
                .registry
                .available()
                .iter()
                .map(|f| f.name().to_string())
                .collect(),
        };
        for name in &names {
            if let Err(e) = self.registry.load(name) {
                error!(extension = %name, error = %e, "failed to load extension");
            }
        }
        for raw in &config.global_extensions {
            let spec: warden_config::ExtensionSpec = match raw.parse() {
                Ok(spec) => spec,
                Err(e) => {
                    error!(extension = %raw, error = %e, "invalid global extension entry");
                    continue;
                },
            };
            let enabled = match self.registry.load(&spec.name) {
                Ok(()) => self
                    .registry
                    .enable(&spec.name, ContextKey::Global, None, &spec.args)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = enabled {
                error!(extension = %spec.name, error = %e, "failed to enable global extension");
            }
        }

        let mut inherited = inherited.unwrap_or_default().connections;
        for name in config.client_names() {
            let resume = inherited.remove(&name);
            match self.table.start(&name, self.deps(), resume) {
                Ok(_) => {},
                Err(Error::AlreadyRunning { .. }) => {
                    warn!(client = %name, "duplicate client entry ignored");
                },
                Err(e) => return Err(e),
            }
        }
        for (name, state) in inherited {
            warn!(client = %name, fd = state.fd, "inherited connection for unconfigured client, closing");
            self.dialer.discard(state);
        }
        Ok(())
    }

    /// Wait for `shutdown`, a host request, or for every supervisor to
    /// finish. Handoff packaging happens here; re-exec is the caller's job.
    pub async fn run<F>(&self, shutdown: F) -> Result<HostExit>
    where
        F: Future<Output = ()>,
    {
        let mut requests = self.requests.lock().await;
        tokio::pin!(shutdown);
        let exit = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break self.shutdown("Shutting down").await;
                },
                request = requests.recv() => match request {
                    Some(HostRequest::Shutdown { reason }) => {
                        info!(%reason, "shutdown requested");
                        break self.shutdown(&reason).await;
                    },
                    Some(HostRequest::Handoff) => {
                        info!("handoff requested");
                        match handoff::collect(&self.table).await {
                            Ok(package) => {
                                self.flush_store().await;
                                break HostExit::HandedOff(package);
                            },
                            Err(e) => {
                                warn!(error = %e, "handoff refused");
                                self.link.handoff_pending.store(false, Ordering::SeqCst);
                            },
                        }
                    },
                    None => {},
                },
                () = self.table.wait_empty() => {
                    info!("nothing running, exiting");
                    self.flush_store().await;
                    break HostExit::Idle;
                },
            }
        };
        Ok(exit)
    }

    async fn shutdown(&self, reason: &str) -> HostExit {
        self.table.stop_all(reason);
        self.table.wait_empty().await;
        if let Err(e) = self.registry.disable_within(&ContextKey::Global).await {
            warn!(error = %e, "global extension teardown failed");
        }
        self.flush_store().await;
        HostExit::Shutdown
    }

    async fn flush_store(&self) {
        if let Err(e) = self.registry.store().flush().await {
            error!(error = %e, "failed to flush store");
        }
    }
}

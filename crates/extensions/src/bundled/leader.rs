//! Redundancy across bot instances sharing one desired identity.
//!
//! Only one connection on the network can hold the desired identity; that
//! one leads. Followers watch their channels and claim the identity as
//! soon as nobody visible holds it. Guarded extensions are enabled only
//! while leading.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    anyhow::Context as _,
    async_trait::async_trait,
    rand::Rng,
    serde::Deserialize,
    tokio::{sync::Notify, time::Instant},
    tracing::{debug, info, warn},
};

use warden_protocol::{Error as ProtocolError, Event};

use crate::{
    commands::CommandPattern,
    context::{ContextKey, Scope},
    error::Error,
    extension::{
        ClientHandle, CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory,
    },
};

const ABDICATED_UNTIL: &str = "abdicated_until_ms";
/// Suffixes tried when stepping down while someone else already holds the
/// first alternative.
const MAX_STEP_ASIDE: usize = 3;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LeaderSettings {
    /// Seconds between periodic checks.
    poll_interval_secs: f64,
    /// Upper bound of the random delay before claiming.
    jitter_ms: u64,
    /// Extensions enabled on this connection only while leading.
    guarded: Vec<String>,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5.0,
            jitter_ms: 500,
            guarded: Vec::new(),
        }
    }
}

pub struct LeaderFactory;

impl ExtensionFactory for LeaderFactory {
    fn name(&self) -> &str {
        "leader"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Elect one leader among instances sharing a nick"
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        let client = context
            .client
            .clone()
            .context("leader needs a connection")?;
        let settings: LeaderSettings = context.settings_as();
        anyhow::ensure!(
            Duration::try_from_secs_f64(settings.poll_interval_secs).is_ok_and(|d| !d.is_zero()),
            "poll_interval_secs must be positive"
        );
        // The store keeps wall-clock millis; the poller runs on a monotonic deadline.
        let abdicated_until = context
            .store
            .get::<u64>(ABDICATED_UNTIL)
            .ok()
            .flatten()
            .and_then(|until| until.checked_sub(now_ms()))
            .filter(|left| *left > 0)
            .map(|left| deadline_after(Duration::from_millis(left)));
        Ok(Arc::new_cyclic(|this| Leader {
            this: this.clone(),
            context,
            client,
            settings,
            abdicated_until: Mutex::new(abdicated_until),
            leading: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }
}

struct Leader {
    this: Weak<Leader>,
    context: Arc<ExtensionContext>,
    client: ClientHandle,
    settings: LeaderSettings,
    abdicated_until: Mutex<Option<Instant>>,
    leading: AtomicBool,
    checking: AtomicBool,
    wake: Notify,
}

/// Clears the in-progress flag when a check ends.
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `timeout` from now, capped at a few decades.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

fn same_identity(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Leader {
    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.settings.poll_interval_secs)
    }

    fn key(&self) -> ContextKey {
        ContextKey::connection(&self.client.name)
    }

    /// Remaining abdication, if any.
    fn abdicated_for(&self) -> Option<Duration> {
        let until = (*self.abdicated_until.lock().unwrap_or_else(|e| e.into_inner()))?;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    fn set_abdicated_until(&self, until: Option<Instant>) {
        *self.abdicated_until.lock().unwrap_or_else(|e| e.into_inner()) = until;
    }

    /// Whether someone in one of our channels holds `identity`.
    fn visible(&self, identity: &str) -> bool {
        let connection = &self.client.connection;
        connection.channels().iter().any(|channel| {
            connection
                .members(channel)
                .is_some_and(|members| members.iter().any(|m| same_identity(m, identity)))
        })
    }

    async fn check(&self) {
        if self.checking.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = CheckGuard(&self.checking);
        let connection = &self.client.connection;
        let desired = connection.desired_identity();

        if self.abdicated_for().is_some() {
            self.demote().await;
            return;
        }
        if same_identity(&connection.identity(), &desired) {
            self.promote().await;
            return;
        }
        self.demote().await;
        if self.visible(&desired) {
            return;
        }

        let jitter = match self.settings.jitter_ms {
            0 => 0,
            max => rand::rng().random_range(0..=max),
        };
        tokio::select! {
            () = self.context.cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(jitter)) => {},
        }
        if self.abdicated_for().is_some() || self.visible(&desired) {
            return;
        }

        match connection.rename(&desired).await {
            Ok(()) => {
                info!(client = %self.client.name, identity = %desired, "claimed desired identity");
                self.promote().await;
            },
            Err(e) => debug!(client = %self.client.name, error = %e, "could not claim desired identity"),
        }
    }

    async fn promote(&self) {
        if self.context.cancel.is_cancelled() || self.leading.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client = %self.client.name, "now leading");
        let Some(registry) = self.context.registry() else {
            return;
        };
        for name in &self.settings.guarded {
            let enabled = match registry.load(name) {
                Ok(()) => registry
                    .enable(name, self.key(), Some(&self.client), &[])
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = enabled {
                warn!(client = %self.client.name, extension = %name, error = %e, "failed to enable guarded extension");
            }
        }
    }

    async fn demote(&self) {
        if !self.leading.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(client = %self.client.name, "no longer leading");
        let Some(registry) = self.context.registry() else {
            return;
        };
        for name in &self.settings.guarded {
            match registry.disable(name, &self.key()).await {
                Ok(()) | Err(Error::NotEnabled { .. } | Error::NotLoaded { .. }) => {},
                Err(e) => {
                    warn!(client = %self.client.name, extension = %name, error = %e, "failed to disable guarded extension");
                },
            }
        }
    }

    /// Move off the desired identity so a peer can claim it.
    async fn step_aside(&self) -> anyhow::Result<()> {
        let connection = &self.client.connection;
        let desired = connection.desired_identity();
        if !same_identity(&connection.identity(), &desired) {
            return Ok(());
        }
        for n in 1..=MAX_STEP_ASIDE {
            let candidate = format!("{desired}{}", "_".repeat(n));
            match connection.rename(&candidate).await {
                Ok(()) => return Ok(()),
                Err(ProtocolError::IdentityTaken { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("no free alternative to {desired}")
    }

    async fn abdicate(&self, call: &CommandCall) -> CommandResult {
        let timeout = match call.args.first() {
            None => self.poll_interval().saturating_mul(2),
            Some(raw) => match raw.parse::<f64>().map(Duration::try_from_secs_f64) {
                Ok(Ok(timeout)) => timeout,
                _ => {
                    call.reply("Bad timeout value").await?;
                    return Ok(());
                },
            },
        };
        info!(client = %self.client.name, ?timeout, "stepping down");
        self.set_abdicated_until(Some(deadline_after(timeout)));
        self.demote().await;
        if let Err(e) = self.step_aside().await {
            warn!(client = %self.client.name, error = %e, "could not step aside; staying on");
            self.set_abdicated_until(None);
            self.wake.notify_one();
            self.context.store.remove(ABDICATED_UNTIL)?;
            return Err(e.into());
        }
        self.context.store.set(
            ABDICATED_UNTIL,
            now_ms().saturating_add(millis(timeout)),
        )?;
        call.reply(&format!("Stepping down for {}s", timeout.as_secs_f64()))
            .await?;
        Ok(())
    }

    async fn status(&self, call: &CommandCall) -> CommandResult {
        let connection = &self.client.connection;
        let role = if self.leading.load(Ordering::SeqCst) {
            "leading"
        } else {
            "following"
        };
        let mut text = format!(
            "{role} as '{}' (desired '{}')",
            connection.identity(),
            connection.desired_identity()
        );
        if let Some(left) = self.abdicated_for() {
            text.push_str(&format!(", abdicated for another {}s", left.as_secs()));
        }
        call.reply(&text).await?;
        Ok(())
    }
}

#[async_trait]
impl Extension for Leader {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("abdicate", 0)
                .summary("Step down as leader for a while")
                .usage("[seconds]"),
            CommandPattern::new("leader status", 0).summary("Show whether this instance leads"),
        ]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let this = self.this.upgrade().context("leader dropped during start")?;
        let cancel = self.context.cancel.clone();
        tokio::spawn(async move {
            loop {
                this.check().await;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(this.poll_interval()) => {},
                    () = this.wake.notified() => {},
                }
            }
            debug!(client = %this.client.name, "leader poller stopped");
        });
        Ok(())
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        match call.name().as_str() {
            "abdicate" => self.abdicate(call).await,
            "leader status" => self.status(call).await,
            other => Err(anyhow::anyhow!("unexpected command '{other}'").into()),
        }
    }

    async fn event(&self, _client: &ClientHandle, event: &Event) {
        if matches!(event, Event::NamesSynced { .. }) || event.is_membership_change() {
            self.wake.notify_one();
        }
    }

    async fn cleanup(&self) {
        self.demote().await;
    }
}

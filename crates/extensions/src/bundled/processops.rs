//! Process-level commands: identify the process, hand off, stop.

use std::{fs, sync::Arc};

use async_trait::async_trait;

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory},
};

pub struct ProcessOpsFactory;

impl ExtensionFactory for ProcessOpsFactory {
    fn name(&self) -> &str {
        "processops"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Inspect, hand off or stop the bot process"
    }

    fn create(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(ProcessOps))
    }
}

struct ProcessOps;

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl Extension for ProcessOps {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("process info", 0).summary("Show pid and host"),
            CommandPattern::new("process handoff", 0)
                .summary("Re-execute, keeping every connection open"),
            CommandPattern::new("process stop", 0).summary("Quit every connection and exit"),
        ]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        let control = &call.client.control;
        match call.name().as_str() {
            "process info" => {
                call.reply(&format!(
                    "Running as pid {} on host {}",
                    std::process::id(),
                    hostname()
                ))
                .await?;
            },
            "process handoff" => {
                if control.request_handoff() {
                    call.reply("Handing off to a new process image").await?;
                } else {
                    call.reply("A handoff is already in progress").await?;
                }
            },
            "process stop" => {
                call.reply("Stopping").await?;
                control.request_shutdown(&format!("Stopped by {}", call.sender()));
            },
            other => return Err(anyhow::anyhow!("unexpected command '{other}'").into()),
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::testing::{fixture, recv_reply};

    #[tokio::test]
    async fn info_reports_pid() {
        let fx = fixture().await;
        fx.enable_here("processops").await;
        let (peer, mut rx) = fx.peer("alice").await;
        fx.route_from(&peer, "warden", "warden: process info").await;
        let text = recv_reply(&mut rx).await.text;
        assert!(
            text.starts_with(&format!("Running as pid {} on host ", std::process::id())),
            "{text}"
        );
    }

    #[tokio::test]
    async fn handoff_and_stop_reach_the_host() {
        let fx = fixture().await;
        fx.enable_here("processops").await;
        let (peer, mut rx) = fx.peer("alice").await;
        fx.route_from(&peer, "warden", "warden: process handoff").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "Handing off to a new process image"
        );
        fx.route_from(&peer, "warden", "warden: process handoff").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "A handoff is already in progress"
        );
        assert_eq!(fx.control.handoffs.load(Ordering::SeqCst), 2);

        fx.route_from(&peer, "warden", "warden: process stop").await;
        recv_reply(&mut rx).await;
        assert_eq!(*fx.control.shutdowns.lock().unwrap(), ["Stopped by alice"]);
    }
}

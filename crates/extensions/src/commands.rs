//! Command patterns and routing of prefixed messages to instances.

use std::sync::{Arc, Mutex};

use {
    tokio::sync::{Mutex as AsyncMutex, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, warn},
};

use warden_protocol::{Event, InboundMessage, gating::is_ignored};

use crate::{
    context::ContextKey,
    extension::{ClientHandle, CommandCall, CommandError, CommandMiss},
    registry::{ExtensionInstance, ExtensionRegistry},
};

/// A command an extension answers to: one or more words, matched
/// case-insensitively as a prefix of the words after the command prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    pub words: Vec<String>,
    pub min_args: usize,
    /// One-line description for command listings.
    pub summary: Option<String>,
    /// Full help text, possibly several lines.
    pub help: Option<String>,
    /// Argument synopsis shown on usage errors.
    pub usage: Option<String>,
}

impl CommandPattern {
    pub fn new(name: &str, min_args: usize) -> Self {
        Self {
            words: name.split_whitespace().map(str::to_lowercase).collect(),
            min_args,
            summary: None,
            help: None,
            usage: None,
        }
    }

    #[must_use]
    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    #[must_use]
    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: &str) -> Self {
        self.usage = Some(usage.to_string());
        self
    }

    pub fn name(&self) -> String {
        self.words.join(" ")
    }

    /// Whether the pattern's words lead `words` (already lower-cased).
    pub fn matches(&self, words: &[String]) -> bool {
        !self.words.is_empty() && words.starts_with(&self.words)
    }
}

/// What became of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Sender is on the client's ignore list.
    Ignored,
    /// No command prefix.
    NotCommand,
    /// Prefixed, but nothing matched. No-match observers were told.
    NoMatch,
    /// Number of callbacks invoked (usage failures included).
    Dispatched(usize),
}

/// The extension callbacks running on behalf of one connection. Each
/// callback gets its own task; [`CallbackTasks::close`] cancels the ones
/// still in flight and returns once all of them have ended.
pub struct CallbackTasks {
    cancel: CancellationToken,
    /// Every running callback holds a clone; `None` once closed.
    alive: Mutex<Option<mpsc::Sender<()>>>,
    drained: AsyncMutex<mpsc::Receiver<()>>,
}

impl Default for CallbackTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackTasks {
    pub fn new() -> Self {
        let (alive, drained) = mpsc::channel(1);
        Self {
            cancel: CancellationToken::new(),
            alive: Mutex::new(Some(alive)),
            drained: AsyncMutex::new(drained),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel running callbacks and wait for them. New callbacks are
    /// refused from here on.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.alive.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut drained = self.drained.lock().await;
        while drained.recv().await.is_some() {}
    }

    /// Run one extension callback on its own task so a panic is contained
    /// and logged. Returns `None` if the callback panicked, was cancelled,
    /// or the set is already closed.
    async fn isolated<F>(&self, extension: &str, callback: F) -> Option<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let alive = self
            .alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let _alive = alive;
            tokio::select! {
                () = cancel.cancelled() => None,
                output = callback => Some(output),
            }
        });
        match task.await {
            Ok(output) => output,
            Err(e) => {
                error!(extension, error = %e, "extension callback panicked");
                None
            },
        }
    }
}

/// Route one inbound message through the commands visible where it was
/// sent. Among matching patterns only the longest win; equally long
/// matches are all invoked, in activation order.
pub async fn dispatch(
    registry: &ExtensionRegistry,
    tasks: &CallbackTasks,
    client: &ClientHandle,
    message: &InboundMessage,
) -> Routed {
    let config = &client.config;
    if is_ignored(
        &message.sender,
        message.sender_mask.as_deref(),
        &config.ignore,
    ) {
        debug!(client = %client.name, sender = %message.sender, "ignored sender");
        return Routed::Ignored;
    }
    let Some(body) = message.text.strip_prefix(config.command_prefix.as_str()) else {
        return Routed::NotCommand;
    };
    let words: Vec<String> = body.split_whitespace().map(String::from).collect();
    let lowered: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();

    let key = ContextKey::for_message(&client.name, message);
    let visible = registry.enabled_for(&key);

    let mut best = 0;
    let mut matched: Vec<(&Arc<ExtensionInstance>, &CommandPattern)> = Vec::new();
    for instance in &visible {
        for pattern in &instance.commands {
            if !pattern.matches(&lowered) {
                continue;
            }
            let len = pattern.words.len();
            if len > best {
                best = len;
                matched.clear();
            }
            if len == best {
                matched.push((instance, pattern));
            }
        }
    }

    if matched.is_empty() {
        let miss = CommandMiss {
            client: client.clone(),
            message: message.clone(),
            words: lowered,
            visible: visible.iter().flat_map(|i| i.commands.clone()).collect(),
            extensions: visible.iter().map(|i| i.name.clone()).collect(),
        };
        let miss = Arc::new(miss);
        for instance in &visible {
            let extension = Arc::clone(&instance.extension);
            let miss = Arc::clone(&miss);
            tasks
                .isolated(&instance.name, async move { extension.no_match(&miss).await })
                .await;
        }
        return Routed::NoMatch;
    }

    let count = matched.len();
    for (instance, pattern) in matched {
        let call = CommandCall {
            client: client.clone(),
            message: message.clone(),
            command: pattern.clone(),
            args: words[pattern.words.len()..].to_vec(),
        };
        let name = pattern.name();
        if call.args.len() < pattern.min_args {
            let text = format!(
                "Command '{name}' requires at least {} args",
                pattern.min_args
            );
            reply_quietly(&call, &text).await;
            continue;
        }

        debug!(extension = %instance.name, command = %name, sender = %message.sender, "dispatching command");
        let extension = Arc::clone(&instance.extension);
        let task_call = call.clone();
        let outcome = tasks
            .isolated(&instance.name, async move {
                extension.command(&task_call).await
            })
            .await;
        if tasks.is_closed() {
            break;
        }
        match outcome {
            Some(Ok(())) => {},
            Some(Err(CommandError::Usage(hint))) => {
                let synopsis = hint.or_else(|| pattern.usage.clone()).unwrap_or_default();
                let text = format!("Usage: {}{name} {synopsis}", config.command_prefix);
                reply_quietly(&call, text.trim_end()).await;
            },
            Some(Err(CommandError::Failed(e))) => {
                warn!(extension = %instance.name, command = %name, error = %e, "command failed");
                reply_quietly(&call, &format!("Command '{name}' failed: {e}")).await;
            },
            None => {
                reply_quietly(&call, &format!("Command '{name}' failed: internal error")).await;
            },
        }
    }
    Routed::Dispatched(count)
}

/// Hand `event` to the event hook of every instance that can see it.
pub async fn deliver_event(
    registry: &ExtensionRegistry,
    tasks: &CallbackTasks,
    client: &ClientHandle,
    event: &Event,
) {
    let key = match event {
        Event::Message(message) => ContextKey::for_message(&client.name, message),
        Event::Joined { channel, .. }
        | Event::Parted { channel, .. }
        | Event::NamesSynced { channel } => ContextKey::channel(&client.name, channel),
        Event::Quit { .. } | Event::Renamed { .. } => ContextKey::connection(&client.name),
    };
    for instance in registry.enabled_for(&key) {
        let extension = Arc::clone(&instance.extension);
        let client = client.clone();
        let event = event.clone();
        tasks
            .isolated(&instance.name, async move {
                extension.event(&client, &event).await;
            })
            .await;
    }
}

async fn reply_quietly(call: &CommandCall, text: &str) {
    if let Err(e) = call.reply(text).await {
        debug!(client = %call.client.name, error = %e, "failed to send reply");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    use crate::{
        context::Scope,
        testing::{Recorder, fixture, recv_reply},
    };

    #[rstest]
    #[case("foo", &["foo"], true)]
    #[case("foo", &["foo", "bar"], true)]
    #[case("foo bar", &["foo"], false)]
    #[case("Foo Bar", &["foo", "bar", "x"], true)]
    #[case("foo", &["food"], false)]
    fn pattern_prefix_matching(#[case] pattern: &str, #[case] words: &[&str], #[case] expected: bool) {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        assert_eq!(CommandPattern::new(pattern, 0).matches(&words), expected);
    }

    async fn with_recorder(recorder: Recorder) -> crate::testing::Fixture {
        let fx = fixture().await;
        fx.add(recorder);
        fx
    }

    #[tokio::test]
    async fn longest_match_wins() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![
            CommandPattern::new("foo", 0),
            CommandPattern::new("foo bar", 0),
        ]))
        .await;
        fx.enable_here("cmds").await;

        let routed = fx.route("alice", "warden", "warden: FOO bar Baz").await;
        assert_eq!(routed, Routed::Dispatched(1));
        assert_eq!(fx.calls_of("cmds"), ["main foo bar [Baz]"]);
    }

    #[tokio::test]
    async fn equal_length_matches_all_run_in_activation_order() {
        let fx = with_recorder(Recorder::new("first").with_commands(vec![CommandPattern::new("foo", 0)]))
            .await;
        fx.add(Recorder::new("second").with_commands(vec![CommandPattern::new("foo", 0)]));
        fx.enable_here("first").await;
        fx.enable_here("second").await;

        assert_eq!(
            fx.route("alice", "warden", "warden: foo").await,
            Routed::Dispatched(2)
        );
        assert_eq!(fx.calls_of("first"), ["main foo []"]);
        assert_eq!(fx.calls_of("second"), ["main foo []"]);
        assert_eq!(fx.journal_names(), ["first", "second"]);
    }

    #[tokio::test]
    async fn longer_pattern_short_on_args_does_not_fall_back() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![
            CommandPattern::new("foo", 0),
            CommandPattern::new("foo bar", 1),
        ]))
        .await;
        fx.enable_here("cmds").await;
        let (peer, mut rx) = fx.peer("alice").await;

        let routed = fx.route_from(&peer, "warden", "warden: foo bar").await;
        assert_eq!(routed, Routed::Dispatched(1));
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "Command 'foo bar' requires at least 1 args"
        );
        assert!(fx.calls_of("cmds").is_empty());

        fx.route_from(&peer, "warden", "warden: foo baz").await;
        assert_eq!(fx.calls_of("cmds"), ["main foo [baz]"]);
    }

    #[tokio::test]
    async fn closing_cancels_callbacks_in_flight() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![
            CommandPattern::new("slow", 0),
            CommandPattern::new("foo", 0),
        ]))
        .await;
        fx.enable_here("cmds").await;

        let (routed, ()) = tokio::join!(fx.route("alice", "warden", "warden: slow"), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            fx.callbacks.close().await;
        });
        assert_eq!(routed, Routed::Dispatched(1));
        assert!(fx.callbacks.is_closed());

        // Nothing runs once the set is closed.
        fx.route("alice", "warden", "warden: foo").await;
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(fx.calls_of("cmds").is_empty());
    }

    #[tokio::test]
    async fn too_few_args_reports_without_invoking() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![CommandPattern::new("foo", 2)]))
            .await;
        fx.enable_here("cmds").await;
        let (peer, mut rx) = fx.peer("alice").await;

        fx.route_from(&peer, "warden", "warden: foo one").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "Command 'foo' requires at least 2 args"
        );
        assert!(fx.calls_of("cmds").is_empty());
    }

    #[tokio::test]
    async fn usage_failure_and_panic_are_reported() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![
            CommandPattern::new("usage", 0).usage("<thing>"),
            CommandPattern::new("fail", 0),
            CommandPattern::new("boom", 0),
        ]))
        .await;
        fx.enable_here("cmds").await;
        let (peer, mut rx) = fx.peer("alice").await;

        fx.route_from(&peer, "warden", "warden: usage").await;
        assert_eq!(recv_reply(&mut rx).await.text, "Usage: warden: usage <thing>");
        fx.route_from(&peer, "warden", "warden: fail").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "Command 'fail' failed: requested failure"
        );
        fx.route_from(&peer, "warden", "warden: boom").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "Command 'boom' failed: internal error"
        );

        // The router keeps working after a panic.
        fx.route_from(&peer, "warden", "warden: usage").await;
        assert!(recv_reply(&mut rx).await.text.starts_with("Usage:"));
    }

    #[tokio::test]
    async fn ignored_and_unprefixed_messages_are_not_routed() {
        let fx = with_recorder(Recorder::new("cmds").with_commands(vec![CommandPattern::new("foo", 0)]))
            .await;
        fx.enable_here("cmds").await;
        assert_eq!(fx.route("spammer", "warden", "warden: foo").await, Routed::Ignored);
        assert_eq!(fx.route("alice", "warden", "foo").await, Routed::NotCommand);
        assert_eq!(fx.route("alice", "warden", "warden: nope").await, Routed::NoMatch);
        assert!(fx.calls_of("cmds").is_empty());
    }

    #[tokio::test]
    async fn channel_scoped_patterns_only_match_their_channel() {
        let fx = with_recorder(
            Recorder::new("local")
                .scoped(Scope::Channel)
                .with_commands(vec![CommandPattern::new("foo", 0)]),
        )
        .await;
        fx.registry.load("local").unwrap();
        fx.registry
            .enable("local", ContextKey::channel("main", "#ops"), Some(&fx.client), &[])
            .await
            .unwrap();

        assert_eq!(fx.route("alice", "#ops", "warden: foo").await, Routed::Dispatched(1));
        assert_eq!(fx.route("alice", "#other", "warden: foo").await, Routed::NoMatch);
        assert_eq!(fx.route("alice", "warden", "warden: foo").await, Routed::NoMatch);
        assert_eq!(fx.calls_of("local"), ["main/#ops foo []"]);
    }

    #[tokio::test]
    async fn events_reach_visible_instances() {
        let fx = with_recorder(Recorder::new("cmds")).await;
        fx.enable_here("cmds").await;
        deliver_event(&fx.registry, &fx.callbacks, &fx.client, &Event::Quit {
            who: "bob".into(),
            reason: "bye".into(),
        })
        .await;
        assert_eq!(fx.calls_of("cmds"), ["main event quit"]);
    }
}

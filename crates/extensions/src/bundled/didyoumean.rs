//! Answers unknown commands with a suggestion.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;

use crate::{
    context::Scope,
    extension::{CommandMiss, Extension, ExtensionContext, ExtensionFactory},
};

pub struct DidYouMeanFactory;

impl ExtensionFactory for DidYouMeanFactory {
    fn name(&self) -> &str {
        "didyoumean"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Suggest commands for unknown input"
    }

    fn create(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(DidYouMean))
    }
}

struct DidYouMean;

#[async_trait]
impl Extension for DidYouMean {
    async fn no_match(&self, miss: &CommandMiss) {
        let prefix = &miss.client.config.command_prefix;
        let help_enabled = miss.extensions.iter().any(|e| e == "help");
        let names: Vec<&[String]> = miss.visible.iter().map(|c| c.words.as_slice()).collect();
        let text = suggestion(&miss.words, &names, prefix, help_enabled);
        if let Err(e) = miss.reply(&text).await {
            tracing::debug!(error = %e, "failed to send suggestion");
        }
    }
}

/// Reply text for a command that matched nothing.
fn suggestion(words: &[String], names: &[&[String]], prefix: &str, help_enabled: bool) -> String {
    if words.is_empty() {
        return "Yes, what?".to_string();
    }

    // Longest run of leading words that is itself a command group.
    let group_len = (1..=words.len())
        .rev()
        .find(|&n| {
            names
                .iter()
                .any(|name| name.len() > n && name[..n] == words[..n])
        })
        .unwrap_or(0);

    if group_len == 0 {
        let candidates: BTreeSet<&str> = names
            .iter()
            .filter_map(|n| n.first())
            .map(String::as_str)
            .collect();
        let got = &words[0];
        return match closest(got, &candidates) {
            Some(m) => format!("No such command '{got}', did you mean '{m}'?"),
            None => format!("No such command '{got}'"),
        };
    }

    let group = words[..group_len].join(" ");
    let help_hint = |lead: &str| {
        if help_enabled {
            format!("{lead}{prefix}help {group}")
        } else {
            String::new()
        }
    };
    let Some(got) = words.get(group_len) else {
        return format!(
            "'{group}' is a command group, please specify a subcommand{}",
            help_hint(" or try ")
        );
    };
    let candidates: BTreeSet<&str> = names
        .iter()
        .filter(|n| n.len() > group_len && n[..group_len] == words[..group_len])
        .map(|n| n[group_len].as_str())
        .collect();
    match closest(got, &candidates) {
        Some(m) => format!("No such subcommand '{got}' in group '{group}', did you mean '{m}'?"),
        None => format!(
            "No such subcommand '{got}' in group '{group}'{}",
            help_hint(", try ")
        ),
    }
}

/// The unique candidate `got` is a prefix of, or failing that the unique
/// candidate sharing the longest leading run (at least two characters).
fn closest<'a>(got: &str, candidates: &BTreeSet<&'a str>) -> Option<&'a str> {
    let extending: Vec<&str> = candidates
        .iter()
        .copied()
        .filter(|c| c.starts_with(got))
        .collect();
    if let [only] = extending.as_slice() {
        return Some(*only);
    }
    if !extending.is_empty() {
        return None;
    }

    let shared = |c: &str| {
        c.chars()
            .zip(got.chars())
            .take_while(|(a, b)| a == b)
            .count()
    };
    let best = candidates.iter().copied().map(shared).max().unwrap_or(0);
    if best < 2 {
        return None;
    }
    let mut nearest = candidates.iter().copied().filter(|c| shared(*c) == best);
    match (nearest.next(), nearest.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    use crate::testing::{fixture, recv_reply};

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    fn reply_for(input: &str, help: bool) -> String {
        let names = [words("plugin load"), words("plugin unload"), words("hello"), words("help")];
        let names: Vec<&[String]> = names.iter().map(Vec::as_slice).collect();
        suggestion(&words(input), &names, "warden: ", help)
    }

    #[rstest]
    #[case("", false, "Yes, what?")]
    #[case("hel", false, "No such command 'hel'")]
    #[case("hell", false, "No such command 'hell', did you mean 'hello'?")]
    #[case("plug", false, "No such command 'plug', did you mean 'plugin'?")]
    #[case("xyzzy", false, "No such command 'xyzzy'")]
    #[case(
        "plugin",
        true,
        "'plugin' is a command group, please specify a subcommand or try warden: help plugin"
    )]
    #[case("plugin", false, "'plugin' is a command group, please specify a subcommand")]
    #[case("plugin lo", false, "No such subcommand 'lo' in group 'plugin', did you mean 'load'?")]
    #[case("plugin zap", true, "No such subcommand 'zap' in group 'plugin', try warden: help plugin")]
    fn suggestions(#[case] input: &str, #[case] help: bool, #[case] expected: &str) {
        assert_eq!(reply_for(input, help), expected);
    }

    #[tokio::test]
    async fn replies_to_unknown_commands() {
        let fx = fixture().await;
        fx.enable_here("didyoumean").await;
        fx.enable_here("echo").await;
        let (peer, mut rx) = fx.peer("alice").await;
        fx.route_from(&peer, "warden", "warden: ech hi").await;
        assert_eq!(
            recv_reply(&mut rx).await.text,
            "No such command 'ech', did you mean 'echo'?"
        );
    }
}

//! Configuration validation.
//!
//! Checks a parsed [`WardenConfig`] for problems that would only surface
//! later at runtime: clients that cannot be resolved, malformed activation
//! lists, unknown extensions, odd channel names.

use std::{collections::HashSet, fmt, path::PathBuf};

use crate::schema::{ExtensionSpec, WardenConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "clients", "client", "extension-spec", "unknown-extension",
    /// "channel"
    pub category: &'static str,
    /// Dotted path, e.g. "clients.main.extensions"
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.severity, self.category, self.path, self.message
        )
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate `config`. When `known_extensions` is given, activation lists
/// naming anything outside it are flagged.
#[must_use]
pub fn validate(config: &WardenConfig, known_extensions: Option<&[String]>) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.clients.is_empty() {
        result.push(
            Severity::Warning,
            "clients",
            "clients",
            "no clients configured; only global extensions will run",
        );
    }

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for entry in &config.clients {
        if seen.insert(entry.name.as_str()) {
            names.push(entry.name.as_str());
        } else {
            result.push(
                Severity::Error,
                "clients",
                format!("clients.{}", entry.name),
                "duplicate client name",
            );
        }
    }

    check_names(
        &mut result,
        "global_extensions",
        config.global_extensions.iter(),
        known_extensions,
    );
    if let Some(load) = &config.load_extensions {
        check_names(&mut result, "load_extensions", load.iter(), known_extensions);
    }

    for name in names {
        let base = format!("clients.{name}");
        let client = match config.client(name) {
            Ok(client) => client,
            Err(e) => {
                result.push(Severity::Error, "client", base, e.to_string());
                continue;
            },
        };

        if client.command_prefix.is_empty() {
            result.push(
                Severity::Error,
                "client",
                format!("{base}.command_prefix"),
                "command prefix must not be empty",
            );
        }

        for channel in &client.channels {
            if !(channel.starts_with('#') || channel.starts_with('&')) {
                result.push(
                    Severity::Warning,
                    "channel",
                    format!("{base}.channels"),
                    format!("{channel:?} does not look like a channel name"),
                );
            }
        }

        check_specs(
            &mut result,
            &format!("{base}.extensions"),
            &client.extensions,
            known_extensions,
        );
        for (channel, specs) in &client.channel_extensions {
            check_specs(
                &mut result,
                &format!("{base}.channel_extensions.{channel}"),
                specs,
                known_extensions,
            );
        }
    }

    result
}

fn check_names<'a>(
    result: &mut ValidationResult,
    path: &str,
    names: impl Iterator<Item = &'a String>,
    known: Option<&[String]>,
) {
    for name in names {
        if let Err(e) = name.parse::<ExtensionSpec>() {
            result.push(Severity::Error, "extension-spec", path, e.to_string());
            continue;
        }
        if let Some(known) = known
            && !known.contains(name)
        {
            result.push(
                Severity::Warning,
                "unknown-extension",
                path,
                format!("unknown extension {name:?}"),
            );
        }
    }
}

fn check_specs(
    result: &mut ValidationResult,
    path: &str,
    specs: &[ExtensionSpec],
    known: Option<&[String]>,
) {
    let Some(known) = known else {
        return;
    };
    for spec in specs {
        if !known.contains(&spec.name) {
            result.push(
                Severity::Warning,
                "unknown-extension",
                path,
                format!("unknown extension {:?}", spec.name),
            );
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> WardenConfig {
        toml::from_str(raw).unwrap()
    }

    fn known() -> Vec<String> {
        ["help", "plugops", "didyoumean", "echo", "hello"]
            .map(String::from)
            .to_vec()
    }

    #[test]
    fn clean_config_has_no_errors() {
        let config = parse(
            r##"
global_extensions = ["hello"]

[[clients]]
name = "main"
host = "irc.example.net"
channels = ["#ops"]
extensions = ["help", "echo"]
"##,
        );
        let result = validate(&config, Some(known().as_slice()));
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0);
    }

    #[test]
    fn empty_config_warns() {
        let result = validate(&WardenConfig::default(), None);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn duplicate_and_unresolvable_clients_are_errors() {
        let config = parse(
            r#"
[[clients]]
name = "a"
host = "h"

[[clients]]
name = "a"
host = "h"

[[clients]]
name = "b"
"#,
        );
        let result = validate(&config, None);
        assert_eq!(result.count(Severity::Error), 2);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "clients.b" && d.message.contains("host"))
        );
    }

    #[test]
    fn malformed_specs_are_errors() {
        let config = parse(
            r#"
global_extensions = ["bad name"]

[[clients]]
name = "main"
host = "h"
extensions = ["leader:a,,b"]
"#,
        );
        let result = validate(&config, None);
        assert_eq!(result.count(Severity::Error), 2);
    }

    #[test]
    fn unknown_extensions_and_channels_warn() {
        let config = parse(
            r##"
[[clients]]
name = "main"
host = "h"
channels = ["ops"]
extensions = ["help", "nosuch"]

[clients.channel_extensions]
"#ops" = ["alsonot"]
"##,
        );
        let result = validate(&config, Some(known().as_slice()));
        assert!(!result.has_errors());
        let categories: Vec<_> = result.diagnostics.iter().map(|d| d.category).collect();
        assert_eq!(
            categories
                .iter()
                .filter(|c| **c == "unknown-extension")
                .count(),
            2
        );
        assert!(categories.contains(&"channel"));
    }

    #[test]
    fn empty_prefix_is_an_error() {
        let config = parse("[[clients]]\nname = \"main\"\nhost = \"h\"\ncommand_prefix = \"\"\n");
        let result = validate(&config, None);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "clients.main.command_prefix");
    }
}

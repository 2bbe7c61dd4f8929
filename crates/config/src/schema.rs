//! Config schema types (store, logging, clients, extension settings).
use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::error::{Error, Result};

pub const DEFAULT_COMMAND_PREFIX: &str = "warden: ";
pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_REAL_NAME: &str = "warden";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// JSON file holding extension state. Defaults to the user data dir.
    pub store_path: Option<PathBuf>,
    /// Extensions to load at startup. `None` loads everything available.
    pub load_extensions: Option<Vec<String>>,
    /// Extensions to enable in the global context at startup.
    pub global_extensions: Vec<String>,
    pub logging: LoggingConfig,
    /// Defaults applied under every entry of `clients`.
    pub client_defaults: ClientOptions,
    pub clients: Vec<ClientEntry>,
    /// Per-extension settings, keyed by extension name.
    pub extension: BTreeMap<String, Value>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            load_extensions: None,
            global_extensions: Vec::new(),
            logging: LoggingConfig::default(),
            client_defaults: ClientOptions {
                command_prefix: Some(DEFAULT_COMMAND_PREFIX.into()),
                extensions: Some(vec!["plugops".into(), "help".into(), "didyoumean".into()]),
                ..ClientOptions::default()
            },
            clients: Vec::new(),
            extension: BTreeMap::new(),
        }
    }
}

/// Logging settings. CLI flags and `RUST_LOG` take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub json: bool,
    /// Also append log lines to this file.
    pub file: Option<PathBuf>,
}

/// A named client entry. Unset options fall back to `client_defaults`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub name: String,
    #[serde(flatten)]
    pub options: ClientOptions,
}

/// Per-client options, all optional so they can be layered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<Secret<String>>,
    /// Desired identity on the network.
    pub nick: Option<String>,
    pub ident: Option<String>,
    pub real_name: Option<String>,
    pub command_prefix: Option<String>,
    pub channels: Option<Vec<String>>,
    /// Ordered activation list, `name` or `name:arg1,arg2`.
    pub extensions: Option<Vec<String>>,
    /// Senders whose messages are never routed (`*` globs allowed).
    pub ignore: Option<Vec<String>>,
    /// Extra extensions enabled only in a specific channel.
    pub channel_extensions: Option<BTreeMap<String, Vec<String>>>,
    /// Per-client overrides of `[extension.<name>]` settings.
    pub extension: Option<BTreeMap<String, Value>>,
}

impl ClientOptions {
    /// Layer `over` on top of `self`, field by field.
    #[must_use]
    pub fn overlay(&self, over: &ClientOptions) -> ClientOptions {
        let extension = match (&self.extension, &over.extension) {
            (Some(base), Some(top)) => {
                let mut merged = base.clone();
                for (name, value) in top {
                    let slot = merged.entry(name.clone()).or_insert(Value::Null);
                    merge_values(slot, value);
                }
                Some(merged)
            },
            (base, top) => top.clone().or_else(|| base.clone()),
        };
        ClientOptions {
            host: over.host.clone().or_else(|| self.host.clone()),
            port: over.port.or(self.port),
            password: over.password.clone().or_else(|| self.password.clone()),
            nick: over.nick.clone().or_else(|| self.nick.clone()),
            ident: over.ident.clone().or_else(|| self.ident.clone()),
            real_name: over.real_name.clone().or_else(|| self.real_name.clone()),
            command_prefix: over
                .command_prefix
                .clone()
                .or_else(|| self.command_prefix.clone()),
            channels: over.channels.clone().or_else(|| self.channels.clone()),
            extensions: over.extensions.clone().or_else(|| self.extensions.clone()),
            ignore: over.ignore.clone().or_else(|| self.ignore.clone()),
            channel_extensions: over
                .channel_extensions
                .clone()
                .or_else(|| self.channel_extensions.clone()),
            extension,
        }
    }
}

/// Fully resolved options for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: Option<Secret<String>>,
    pub nick: String,
    pub ident: String,
    pub real_name: String,
    pub command_prefix: String,
    pub channels: Vec<String>,
    pub extensions: Vec<ExtensionSpec>,
    pub ignore: Vec<String>,
    pub channel_extensions: BTreeMap<String, Vec<ExtensionSpec>>,
    pub extension: BTreeMap<String, Value>,
}

impl ClientConfig {
    fn resolve(name: &str, options: ClientOptions) -> Result<Self> {
        let host = options
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::MissingField {
                client: name.to_string(),
                field: "host",
            })?;
        let nick = options.nick.unwrap_or_else(|| name.to_string());
        let extensions = parse_specs(options.extensions.unwrap_or_default())?;
        let mut channel_extensions = BTreeMap::new();
        for (channel, specs) in options.channel_extensions.unwrap_or_default() {
            channel_extensions.insert(channel, parse_specs(specs)?);
        }
        Ok(Self {
            name: name.to_string(),
            host,
            port: options.port.unwrap_or(DEFAULT_PORT),
            password: options.password,
            ident: options.ident.unwrap_or_else(|| nick.clone()),
            nick,
            real_name: options
                .real_name
                .unwrap_or_else(|| DEFAULT_REAL_NAME.to_string()),
            command_prefix: options
                .command_prefix
                .unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string()),
            channels: options.channels.unwrap_or_default(),
            extensions,
            ignore: options.ignore.unwrap_or_default(),
            channel_extensions,
            extension: options.extension.unwrap_or_default(),
        })
    }

    /// The configured server password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret().as_str())
    }
}

impl WardenConfig {
    /// Names of all configured clients, in file order.
    pub fn client_names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolve a client by name, applying `client_defaults`.
    pub fn client(&self, name: &str) -> Result<ClientConfig> {
        let entry = self
            .clients
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::unknown_client(name))?;
        let options = self.client_defaults.overlay(&entry.options);
        ClientConfig::resolve(name, options)
    }

    /// Settings for an extension: the global `[extension.<name>]` table
    /// overlaid with the client's own table for that extension.
    pub fn extension_settings(&self, extension: &str, client: Option<&ClientConfig>) -> Value {
        let mut settings = self
            .extension
            .get(extension)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));
        if let Some(top) = client.and_then(|c| c.extension.get(extension)) {
            merge_values(&mut settings, top);
        }
        settings
    }
}

/// An entry of an extension activation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl FromStr for ExtensionSpec {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidExtensionSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (name, args): (&str, Vec<&str>) = match spec.split_once(':') {
            Some((name, args)) => (name.trim(), args.split(',').map(str::trim).collect()),
            None => (spec.trim(), Vec::new()),
        };
        if name.is_empty() {
            return Err(invalid("empty extension name"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid("extension name contains whitespace"));
        }
        if args.iter().any(|a| a.is_empty()) {
            return Err(invalid("empty argument"));
        }
        Ok(Self {
            name: name.to_string(),
            args: args.into_iter().map(String::from).collect(),
        })
    }
}

impl fmt::Display for ExtensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.args.join(","))
        }
    }
}

fn parse_specs(specs: Vec<String>) -> Result<Vec<ExtensionSpec>> {
    specs.iter().map(|s| s.parse()).collect()
}

/// Merge `top` into `base`: objects merge key by key, anything else replaces.
fn merge_values(base: &mut Value, top: &Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                merge_values(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        },
        (base, top) => *base = top.clone(),
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {rstest::rstest, serde_json::json};

    use super::*;

    fn config_from(raw: &str) -> WardenConfig {
        toml::from_str(raw).unwrap()
    }

    #[rstest]
    #[case("help", "help", &[])]
    #[case("leader:5,fast", "leader", &["5", "fast"])]
    #[case(" echo ", "echo", &[])]
    fn parses_extension_specs(#[case] raw: &str, #[case] name: &str, #[case] args: &[&str]) {
        let spec: ExtensionSpec = raw.parse().unwrap();
        assert_eq!(spec.name, name);
        assert_eq!(spec.args, args);
    }

    #[rstest]
    #[case("")]
    #[case(":a")]
    #[case("two words")]
    #[case("leader:a,,b")]
    fn rejects_malformed_specs(#[case] raw: &str) {
        assert!(raw.parse::<ExtensionSpec>().is_err());
    }

    #[test]
    fn spec_display_roundtrips_args() {
        let spec: ExtensionSpec = "leader:1,2".parse().unwrap();
        assert_eq!(spec.to_string(), "leader:1,2");
    }

    #[test]
    fn client_inherits_defaults() {
        let config = config_from(
            r##"
[client_defaults]
host = "irc.example.net"
command_prefix = "bot: "
extensions = ["help"]

[[clients]]
name = "main"
nick = "warden"
channels = ["#ops"]
"##,
        );
        let client = config.client("main").unwrap();
        assert_eq!(client.host, "irc.example.net");
        assert_eq!(client.port, DEFAULT_PORT);
        assert_eq!(client.nick, "warden");
        assert_eq!(client.ident, "warden");
        assert_eq!(client.command_prefix, "bot: ");
        assert_eq!(client.channels, vec!["#ops".to_string()]);
        assert_eq!(client.extensions[0].name, "help");
    }

    #[test]
    fn client_overrides_win() {
        let config = config_from(
            r#"
[client_defaults]
host = "a.example.net"
extensions = ["help"]

[[clients]]
name = "main"
host = "b.example.net"
port = 7000
extensions = ["echo", "leader:3"]
"#,
        );
        let client = config.client("main").unwrap();
        assert_eq!(client.host, "b.example.net");
        assert_eq!(client.port, 7000);
        assert_eq!(client.nick, "main");
        let names: Vec<_> = client.extensions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["echo", "leader"]);
        assert_eq!(client.extensions[1].args, ["3"]);
    }

    #[test]
    fn missing_host_is_reported() {
        let config = config_from("[[clients]]\nname = \"lonely\"\n");
        match config.client("lonely") {
            Err(Error::MissingField { field, .. }) => assert_eq!(field, "host"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn unknown_client_is_reported() {
        let config = WardenConfig::default();
        assert!(matches!(
            config.client("nope"),
            Err(Error::UnknownClient { .. })
        ));
    }

    #[test]
    fn default_config_enables_core_extensions() {
        let config = config_from("[[clients]]\nname = \"x\"\nhost = \"h\"\n");
        let client = config.client("x").unwrap();
        assert_eq!(client.command_prefix, DEFAULT_COMMAND_PREFIX);
        assert!(client.extensions.iter().any(|e| e.name == "plugops"));
    }

    #[test]
    fn extension_settings_layer_client_over_global() {
        let config = config_from(
            r#"
[extension.leader]
poll_interval_secs = 5
guarded = ["echo"]

[[clients]]
name = "main"
host = "h"
[clients.extension.leader]
poll_interval_secs = 1
"#,
        );
        let client = config.client("main").unwrap();
        let settings = config.extension_settings("leader", Some(&client));
        assert_eq!(settings, json!({"poll_interval_secs": 1, "guarded": ["echo"]}));
        let global = config.extension_settings("leader", None);
        assert_eq!(global["poll_interval_secs"], 5);
        assert_eq!(config.extension_settings("other", None), json!({}));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = config_from(
            "[[clients]]\nname = \"main\"\nhost = \"h\"\npassword = \"hunter2\"\n",
        );
        let client = config.client("main").unwrap();
        assert_eq!(client.password(), Some("hunter2"));
        assert!(!format!("{client:?}").contains("hunter2"));
    }
}

//! Shared, replaceable view of the loaded configuration.
//!
//! Supervisors resolve their client through the handle on every connection
//! attempt, so a `config load` or `config set` takes effect on the next
//! reconnect without touching live connections.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use {serde_json::Value, tracing::info};

use crate::{
    error::{Context, Error, Result},
    loader::load_config,
    schema::{ClientConfig, WardenConfig},
};

/// Keys whose values are never shown back to chat users.
const REDACTED_KEYS: &[&str] = &["password"];

#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<WardenConfig>>>,
    source: Arc<RwLock<Option<PathBuf>>>,
}

impl ConfigHandle {
    pub fn new(config: WardenConfig, source: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: Arc::new(RwLock::new(source)),
        }
    }

    /// Cheap snapshot of the current configuration.
    pub fn snapshot(&self) -> Arc<WardenConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// The file the configuration was last loaded from.
    pub fn source(&self) -> Option<PathBuf> {
        self.source.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, config: WardenConfig) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    pub fn client(&self, name: &str) -> Result<ClientConfig> {
        self.snapshot().client(name)
    }

    /// Load `path` and make it the current configuration.
    pub fn load_from(&self, path: &Path) -> Result<()> {
        let config = load_config(path)?;
        self.replace(config);
        *self.source.write().unwrap_or_else(|e| e.into_inner()) = Some(path.to_path_buf());
        info!(path = %path.display(), "configuration loaded");
        Ok(())
    }

    /// Read a value by dotted path (`clients.0.nick`). Secrets are redacted.
    pub fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let mut root = serde_json::to_value(&*self.snapshot())?;
        redact(&mut root);
        let mut node = &root;
        for segment in split_key(key)? {
            node = match node {
                Value::Object(map) => match map.get(segment) {
                    Some(child) => child,
                    None => return Ok(None),
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(child) => child,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(node.clone()))
    }

    /// Set a value by dotted path. Missing object levels are created; the
    /// result must still deserialize as a valid configuration.
    pub fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let segments = split_key(key)?;
        let mut root = serde_json::to_value(&*self.snapshot())?;
        let (last, parents) = segments
            .split_last()
            .context(format!("empty config key {key:?}"))?;

        let mut node = &mut root;
        for segment in parents {
            node = child_mut(node, segment, key)?;
        }
        match node {
            Value::Object(map) => {
                map.insert((*last).to_string(), value);
            },
            Value::Array(items) => {
                let slot = last
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| Error::invalid_key(key, "array index out of range"))?;
                *slot = value;
            },
            _ => return Err(Error::invalid_key(key, "parent is not a table")),
        }

        let config: WardenConfig = serde_json::from_value(root)
            .map_err(|e| Error::invalid_key(key, e.to_string()))?;
        self.replace(config);
        info!(key, "configuration value set");
        Ok(())
    }
}

fn split_key(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::invalid_key(key, "empty path segment"));
    }
    Ok(segments)
}

fn child_mut<'a>(node: &'a mut Value, segment: &str, key: &str) -> Result<&'a mut Value> {
    match node {
        Value::Object(map) => {
            let child = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if child.is_null() {
                *child = Value::Object(Default::default());
            }
            Ok(child)
        },
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .ok_or_else(|| Error::invalid_key(key, "array index out of range")),
        _ => Err(Error::invalid_key(key, "parent is not a table")),
    }
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if REDACTED_KEYS.contains(&key.as_str()) && !child.is_null() {
                    *child = Value::String("[REDACTED]".into());
                } else {
                    redact(child);
                }
            }
        },
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {},
    }
}

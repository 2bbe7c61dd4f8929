use std::sync::Arc;

use {
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::{Error, Result},
    store_file::JsonStore,
};

/// A view of one nested table of a [`JsonStore`].
///
/// A namespace can be bound to a cancellation token; once the token fires
/// every access fails with [`Error::Inactive`] while the stored data stays
/// in place for the next holder of the same path.
#[derive(Clone)]
pub struct StoreNamespace {
    store: Arc<JsonStore>,
    path: Vec<String>,
    active: Option<CancellationToken>,
}

impl StoreNamespace {
    pub(crate) fn new(store: Arc<JsonStore>, path: Vec<String>) -> Self {
        Self {
            store,
            path,
            active: None,
        }
    }

    /// Tie usability of this namespace to `token`.
    #[must_use]
    pub fn bound_to(mut self, token: CancellationToken) -> Self {
        self.active = Some(token);
        self
    }

    /// A namespace one level below this one.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(segment.into());
        Self {
            store: Arc::clone(&self.store),
            path,
            active: self.active.clone(),
        }
    }

    /// Slash-joined path, for logs.
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }

    pub fn is_active(&self) -> bool {
        self.active.as_ref().is_none_or(|t| !t.is_cancelled())
    }

    fn check(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::inactive(self.display_path()))
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.check()?;
        let value = self
            .store
            .read(&self.path, |table| table.and_then(|t| t.get(key)).cloned());
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        self.check()?;
        let value = serde_json::to_value(value)?;
        self.store.write(&self.path, |table| {
            table.insert(key.to_string(), value);
        })
    }

    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.check()?;
        let present = self
            .store
            .read(&self.path, |table| table.is_some_and(|t| t.contains_key(key)));
        if !present {
            return Ok(None);
        }
        self.store.write(&self.path, |table| table.remove(key))
    }

    /// Keys stored directly in this namespace, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.store.read(&self.path, |table| {
            table
                .map(|t| t.keys().cloned().collect())
                .unwrap_or_default()
        }))
    }

    /// Flush the whole underlying store.
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

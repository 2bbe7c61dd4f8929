//! Where extension factories come from.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::{bundled, extension::ExtensionFactory};

/// A place the registry searches when loading an extension by name.
pub trait ExtensionSource: Send + Sync {
    fn name(&self) -> &str;

    fn find(&self, extension: &str) -> Option<Arc<dyn ExtensionFactory>>;

    /// Every factory this source can provide.
    fn available(&self) -> Vec<Arc<dyn ExtensionFactory>>;
}

/// The extensions compiled into this binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BundledSource;

impl ExtensionSource for BundledSource {
    fn name(&self) -> &str {
        "bundled"
    }

    fn find(&self, extension: &str) -> Option<Arc<dyn ExtensionFactory>> {
        bundled::factories()
            .into_iter()
            .find(|f| f.name() == extension)
    }

    fn available(&self) -> Vec<Arc<dyn ExtensionFactory>> {
        bundled::factories()
    }
}

/// A source whose contents can be swapped at runtime. A later `reload`
/// picks up whatever factory is registered under the name at that time.
#[derive(Default)]
pub struct StaticSource {
    name: String,
    factories: RwLock<BTreeMap<String, Arc<dyn ExtensionFactory>>>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: RwLock::default(),
        }
    }

    /// Register `factory`, replacing any previous one with the same name.
    pub fn insert(&self, factory: Arc<dyn ExtensionFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(factory.name().to_string(), factory);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.remove(name).is_some()
    }
}

impl ExtensionSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, extension: &str) -> Option<Arc<dyn ExtensionFactory>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(extension).cloned()
    }

    fn available(&self) -> Vec<Arc<dyn ExtensionFactory>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.values().cloned().collect()
    }
}

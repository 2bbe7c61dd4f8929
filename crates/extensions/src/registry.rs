//! Loaded extensions and their enabled instances.
//!
//! An extension is *loaded* once a source provides its factory, and
//! *enabled* per [`ContextKey`]: each enable builds a fresh instance bound to
//! that context. An extension cannot be unloaded while any instance is
//! alive.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {warden_config::ConfigHandle, warden_store::JsonStore};

use crate::{
    commands::CommandPattern,
    context::{ContextKey, Scope},
    error::{Error, Result},
    extension::{ClientHandle, Extension, ExtensionContext, ExtensionFactory},
    source::ExtensionSource,
};

/// An enabled extension bound to one context.
pub struct ExtensionInstance {
    pub name: String,
    pub key: ContextKey,
    /// Activation order across the whole registry.
    pub seq: u64,
    pub extension: Arc<dyn Extension>,
    pub context: Arc<ExtensionContext>,
    pub commands: Vec<CommandPattern>,
}

struct Loaded {
    factory: Arc<dyn ExtensionFactory>,
    source: String,
    instances: BTreeMap<ContextKey, Arc<ExtensionInstance>>,
}

pub struct ExtensionRegistry {
    this: Weak<Self>,
    sources: Vec<Arc<dyn ExtensionSource>>,
    loaded: RwLock<BTreeMap<String, Loaded>>,
    store: Arc<JsonStore>,
    config: ConfigHandle,
    next_seq: AtomicU64,
}

impl ExtensionRegistry {
    /// Sources are searched in order when loading.
    pub fn new(
        sources: Vec<Arc<dyn ExtensionSource>>,
        store: Arc<JsonStore>,
        config: ConfigHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            sources,
            loaded: RwLock::default(),
            store,
            config,
            next_seq: AtomicU64::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Loaded>> {
        self.loaded.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Loaded>> {
        self.loaded.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    /// Every factory the sources offer, first source winning on name clashes.
    pub fn available(&self) -> Vec<Arc<dyn ExtensionFactory>> {
        let mut seen = BTreeMap::new();
        for source in &self.sources {
            for factory in source.available() {
                seen.entry(factory.name().to_string()).or_insert(factory);
            }
        }
        seen.into_values().collect()
    }

    /// Load `name` from the first source that has it. Loading an already
    /// loaded extension does nothing.
    pub fn load(&self, name: &str) -> Result<()> {
        if self.is_loaded(name) {
            return Ok(());
        }
        let (source, factory) = self
            .sources
            .iter()
            .find_map(|s| s.find(name).map(|f| (s.name().to_string(), f)))
            .ok_or_else(|| Error::load(name, "not found in any extension source"))?;
        if factory.name() != name {
            return Err(Error::load(
                name,
                format!("source {source} provided {}", factory.name()),
            ));
        }
        let mut loaded = self.write();
        if !loaded.contains_key(name) {
            info!(extension = name, source = %source, scope = %factory.scope(), "extension loaded");
            loaded.insert(name.to_string(), Loaded {
                factory,
                source,
                instances: BTreeMap::new(),
            });
        }
        Ok(())
    }

    pub fn unload(&self, name: &str) -> Result<()> {
        let mut loaded = self.write();
        let entry = loaded.get(name).ok_or_else(|| Error::not_loaded(name))?;
        if !entry.instances.is_empty() {
            return Err(Error::Referenced {
                name: name.to_string(),
                count: entry.instances.len(),
            });
        }
        loaded.remove(name);
        info!(extension = name, "extension unloaded");
        Ok(())
    }

    /// Unload then load again, picking up the source's current factory.
    pub fn reload(&self, name: &str) -> Result<()> {
        self.unload(name)?;
        self.load(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Names of loaded extensions, sorted.
    pub fn loaded(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        self.read().get(name).map(|e| e.factory.scope())
    }

    pub fn source_of(&self, name: &str) -> Option<String> {
        self.read().get(name).map(|e| e.source.clone())
    }

    pub fn instance(&self, name: &str, key: &ContextKey) -> Option<Arc<ExtensionInstance>> {
        self.read()
            .get(name)
            .and_then(|e| e.instances.get(key))
            .cloned()
    }

    /// Instances bound to `key` or to any context containing it, in
    /// activation order.
    pub fn enabled_for(&self, key: &ContextKey) -> Vec<Arc<ExtensionInstance>> {
        let mut found: Vec<_> = self
            .read()
            .values()
            .flat_map(|e| e.instances.values())
            .filter(|i| i.key.contains(key))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.seq);
        found
    }

    /// Instances bound to `scope` or to any context inside it.
    pub fn enabled_within(&self, scope: &ContextKey) -> Vec<Arc<ExtensionInstance>> {
        let mut found: Vec<_> = self
            .read()
            .values()
            .flat_map(|e| e.instances.values())
            .filter(|i| scope.contains(&i.key))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.seq);
        found
    }

    /// Enable `name` in `key`. Enabling where an instance already exists
    /// returns that instance.
    pub async fn enable(
        &self,
        name: &str,
        key: ContextKey,
        client: Option<&ClientHandle>,
        args: &[String],
    ) -> Result<Arc<ExtensionInstance>> {
        let factory = {
            let loaded = self.read();
            let entry = loaded.get(name).ok_or_else(|| Error::not_loaded(name))?;
            if let Some(existing) = entry.instances.get(&key) {
                debug!(extension = name, context = %key, "extension already enabled");
                return Ok(Arc::clone(existing));
            }
            Arc::clone(&entry.factory)
        };

        if factory.scope() != key.scope() {
            return Err(Error::ScopeMismatch {
                name: name.to_string(),
                expected: factory.scope(),
                got: key.scope(),
            });
        }
        if key.scope() != Scope::Global && client.is_none() {
            return Err(Error::MissingClient {
                name: name.to_string(),
                context: key,
            });
        }

        let settings = self
            .config
            .snapshot()
            .extension_settings(name, client.map(|c| c.config.as_ref()));
        let cancel = CancellationToken::new();
        let mut path = vec![name.to_string()];
        path.extend(key.store_path());
        let context = Arc::new(ExtensionContext {
            name: name.to_string(),
            key: key.clone(),
            args: args.to_vec(),
            client: client.cloned(),
            config: self.config.clone(),
            store: self.store.namespace(path).bound_to(cancel.clone()),
            settings,
            cancel,
            registry: self.this.clone(),
        });

        let init_error = |e: anyhow::Error| Error::Init {
            name: name.to_string(),
            reason: format!("{e:#}"),
        };
        let extension = factory.create(Arc::clone(&context)).map_err(init_error)?;
        if let Err(e) = extension.start().await {
            context.cancel.cancel();
            extension.cleanup().await;
            return Err(init_error(e));
        }

        let instance = Arc::new(ExtensionInstance {
            name: name.to_string(),
            key: key.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            commands: extension.commands(),
            extension,
            context,
        });

        // Another enable of the same pair may have finished while we were
        // starting; the first one to register wins.
        let rival = {
            let mut loaded = self.write();
            match loaded.get_mut(name) {
                None => Err(Error::not_loaded(name)),
                Some(entry) => match entry.instances.get(&key) {
                    Some(existing) => Ok(Some(Arc::clone(existing))),
                    None => {
                        entry.instances.insert(key.clone(), Arc::clone(&instance));
                        Ok(None)
                    },
                },
            }
        };
        match rival {
            Ok(None) => {
                info!(extension = name, context = %key, "extension enabled");
                Ok(instance)
            },
            Ok(Some(existing)) => {
                retire(&instance).await;
                Ok(existing)
            },
            Err(e) => {
                retire(&instance).await;
                Err(e)
            },
        }
    }

    /// Disable the instance of `name` bound exactly to `key`.
    pub async fn disable(&self, name: &str, key: &ContextKey) -> Result<()> {
        let instance = {
            let mut loaded = self.write();
            let entry = loaded.get_mut(name).ok_or_else(|| Error::not_loaded(name))?;
            entry
                .instances
                .remove(key)
                .ok_or_else(|| Error::not_enabled(name, key))?
        };
        retire(&instance).await;
        info!(extension = name, context = %key, "extension disabled");
        Ok(())
    }

    /// Disable every instance inside `scope`, newest first. Fails with
    /// [`Error::Referenced`] if instances remain afterwards, e.g. because a
    /// cleanup enabled something again.
    pub async fn disable_within(&self, scope: &ContextKey) -> Result<()> {
        let mut targets = self.enabled_within(scope);
        targets.reverse();
        for instance in targets {
            match self.disable(&instance.name, &instance.key).await {
                Ok(()) | Err(Error::NotEnabled { .. } | Error::NotLoaded { .. }) => {},
                Err(e) => return Err(e),
            }
        }
        let remaining = self.enabled_within(scope);
        if let Some(first) = remaining.first() {
            warn!(context = %scope, remaining = remaining.len(), "instances re-enabled during teardown");
            return Err(Error::Referenced {
                name: first.name.clone(),
                count: remaining.len(),
            });
        }
        Ok(())
    }
}

async fn retire(instance: &ExtensionInstance) {
    instance.context.cancel.cancel();
    instance.extension.cleanup().await;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{Recorder, fixture};

    #[tokio::test]
    async fn load_is_idempotent_and_unknown_names_fail() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        fx.registry.load("recorder").unwrap();
        assert_eq!(fx.registry.source_of("recorder").as_deref(), Some("test"));
        assert!(matches!(
            fx.registry.load("nonexistent"),
            Err(Error::Load { .. })
        ));
    }

    #[tokio::test]
    async fn enable_is_idempotent_per_context() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        let key = ContextKey::connection("main");
        let a = fx
            .registry
            .enable("recorder", key.clone(), Some(&fx.client), &[])
            .await
            .unwrap();
        let b = fx
            .registry
            .enable("recorder", key.clone(), Some(&fx.client), &[])
            .await
            .unwrap();
        assert_eq!(a.seq, b.seq);
        assert_eq!(fx.log_of("recorder"), ["start main"]);
    }

    #[tokio::test]
    async fn unload_refused_while_enabled() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        let key = ContextKey::connection("main");
        fx.registry
            .enable("recorder", key.clone(), Some(&fx.client), &[])
            .await
            .unwrap();
        assert!(matches!(
            fx.registry.unload("recorder"),
            Err(Error::Referenced { count: 1, .. })
        ));
        fx.registry.disable("recorder", &key).await.unwrap();
        fx.registry.unload("recorder").unwrap();
        assert!(!fx.registry.is_loaded("recorder"));
        assert_eq!(fx.log_of("recorder"), ["start main", "cleanup main"]);
    }

    #[tokio::test]
    async fn scope_and_state_errors() {
        let fx = fixture().await;
        let key = ContextKey::connection("main");
        assert!(matches!(
            fx.registry.enable("recorder", key.clone(), Some(&fx.client), &[]).await,
            Err(Error::NotLoaded { .. })
        ));
        fx.registry.load("recorder").unwrap();
        assert!(matches!(
            fx.registry.enable("recorder", ContextKey::Global, None, &[]).await,
            Err(Error::ScopeMismatch { .. })
        ));
        assert!(matches!(
            fx.registry.enable("recorder", key.clone(), None, &[]).await,
            Err(Error::MissingClient { .. })
        ));
        assert!(matches!(
            fx.registry.disable("recorder", &key).await,
            Err(Error::NotEnabled { .. })
        ));
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_enabled() {
        let fx = fixture().await;
        fx.add(Recorder::new("broken").failing());
        fx.registry.load("broken").unwrap();
        let err = fx
            .registry
            .enable("broken", ContextKey::connection("main"), Some(&fx.client), &[])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Init { .. }));
        assert!(fx.registry.enabled_for(&ContextKey::connection("main")).is_empty());
        fx.registry.unload("broken").unwrap();
    }

    #[tokio::test]
    async fn enabled_for_includes_broader_contexts_in_activation_order() {
        let fx = fixture().await;
        for name in ["recorder", "hello", "echo"] {
            fx.registry.load(name).unwrap();
        }
        fx.registry
            .enable("echo", ContextKey::connection("main"), Some(&fx.client), &[])
            .await
            .unwrap();
        fx.registry
            .enable("hello", ContextKey::Global, None, &[])
            .await
            .unwrap();

        let in_channel = fx.registry.enabled_for(&ContextKey::channel("main", "#ops"));
        let names: Vec<_> = in_channel.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["echo", "hello"]);
        assert_eq!(fx.registry.enabled_for(&ContextKey::Global).len(), 1);
        assert!(fx.registry.enabled_for(&ContextKey::connection("other")).iter().all(|i| i.name == "hello"));
    }

    #[tokio::test]
    async fn disable_within_tears_down_a_connection_and_its_channels() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        fx.registry.load("hello").unwrap();
        fx.registry
            .enable("recorder", ContextKey::connection("main"), Some(&fx.client), &[])
            .await
            .unwrap();
        fx.registry
            .enable("hello", ContextKey::Global, None, &[])
            .await
            .unwrap();
        fx.registry
            .disable_within(&ContextKey::connection("main"))
            .await
            .unwrap();
        assert!(fx.registry.enabled_within(&ContextKey::connection("main")).is_empty());
        assert_eq!(fx.registry.enabled_within(&ContextKey::Global).len(), 1);
    }

    #[tokio::test]
    async fn store_namespace_dies_with_the_instance() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        let key = ContextKey::connection("main");
        let instance = fx
            .registry
            .enable("recorder", key.clone(), Some(&fx.client), &[])
            .await
            .unwrap();
        instance.context.store.set("seen", 1).unwrap();
        fx.registry.disable("recorder", &key).await.unwrap();
        assert!(instance.context.store.get::<u32>("seen").is_err());

        let again = fx
            .registry
            .enable("recorder", key, Some(&fx.client), &[])
            .await
            .unwrap();
        assert_eq!(again.context.store.get::<u32>("seen").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn reload_picks_up_replaced_factory() {
        let fx = fixture().await;
        fx.registry.load("recorder").unwrap();
        fx.add(Recorder::new("recorder").failing());
        fx.registry.reload("recorder").unwrap();
        assert!(
            fx.registry
                .enable("recorder", ContextKey::connection("main"), Some(&fx.client), &[])
                .await
                .is_err()
        );
    }
}

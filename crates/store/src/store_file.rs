//! JSON file-backed store with atomic writes.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    serde_json::{Map, Value},
    tokio::{fs, sync::Mutex},
    tracing::debug,
};

use crate::{
    error::{Context, Error, Result},
    namespace::StoreNamespace,
};

type Table = Map<String, Value>;

/// The whole store, held in memory and written out on [`JsonStore::flush`].
pub struct JsonStore {
    path: Option<PathBuf>,
    root: RwLock<Table>,
    dirty: AtomicBool,
    flushing: Mutex<()>,
}

impl JsonStore {
    /// Open (or lazily create) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let root = if fs::try_exists(&path).await.unwrap_or(false) {
            let data = fs::read_to_string(&path).await?;
            if data.trim().is_empty() {
                Table::new()
            } else {
                serde_json::from_str(&data)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
        } else {
            Table::new()
        };
        debug!(path = %path.display(), entries = root.len(), "store opened");
        Ok(Arc::new(Self {
            path: Some(path),
            root: RwLock::new(root),
            dirty: AtomicBool::new(false),
            flushing: Mutex::new(()),
        }))
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            root: RwLock::new(Table::new()),
            dirty: AtomicBool::new(false),
            flushing: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A namespace nested under `path`; each segment is one table level.
    pub fn namespace<I, S>(self: &Arc<Self>, path: I) -> StoreNamespace
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StoreNamespace::new(Arc::clone(self), path.into_iter().map(Into::into).collect())
    }

    /// Atomic write: write to temp, keep `.bak`, rename over target.
    /// A clean store is not rewritten.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flushing.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let json = {
            let root = self.root.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*root)?
        };
        if let Err(e) = write_atomic(path, json.as_bytes()).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %path.display(), "store flushed");
        Ok(())
    }

    pub(crate) fn read<R>(&self, path: &[String], f: impl FnOnce(Option<&Table>) -> R) -> R {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let mut table = Some(&*root);
        for segment in path {
            table = table
                .and_then(|t| t.get(segment))
                .and_then(Value::as_object);
        }
        f(table)
    }

    pub(crate) fn write<R>(&self, path: &[String], f: impl FnOnce(&mut Table) -> R) -> Result<R> {
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let mut table = &mut *root;
        for (depth, segment) in path.iter().enumerate() {
            let slot = table
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Table::new()));
            table = slot.as_object_mut().ok_or_else(|| Error::NotATable {
                path: path[..=depth].join("/"),
            })?;
        }
        let out = f(table);
        self.dirty.store(true, Ordering::Release);
        Ok(out)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;

    if fs::try_exists(path).await.unwrap_or(false) {
        let bak = path.with_extension("json.bak");
        let _ = fs::copy(path, &bak).await;
    }

    fs::rename(&tmp, path).await?;
    Ok(())
}

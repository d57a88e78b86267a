//! Client-side shared state.
//!
//! A `SharedState` holds one value, hands out receivers that are notified when
//! it changes, and writes every change through a `Persistence` backend before
//! publishing it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// What the terminal client remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: Option<String>,
    pub logo_url: Option<String>,
}

pub trait Persistence<T>: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>>;

    fn save(&self, value: &T) -> Result<()>;
}

/// JSON file on disk, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilePersistence { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned> Persistence<T> for FilePersistence {
    fn load(&self) -> Result<Option<T>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(value))
    }

    fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPersistence<T> {
    value: Mutex<Option<T>>,
}

impl<T> MemoryPersistence<T> {
    pub fn new() -> Self {
        MemoryPersistence {
            value: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send> Persistence<T> for MemoryPersistence<T> {
    fn load(&self) -> Result<Option<T>> {
        let value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        Ok(value.clone())
    }

    fn save(&self, value: &T) -> Result<()> {
        let mut stored = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *stored = Some(value.clone());
        Ok(())
    }
}

pub struct SharedState<T> {
    tx: watch::Sender<T>,
    persistence: Arc<dyn Persistence<T>>,
}

impl<T> SharedState<T>
where
    T: Clone + Default + PartialEq + Send + Sync + 'static,
{
    /// Starts from the persisted value, or `T::default()` if there is none.
    pub fn load(persistence: Arc<dyn Persistence<T>>) -> Result<Self> {
        let initial = persistence.load()?.unwrap_or_default();
        let (tx, _rx) = watch::channel(initial);
        Ok(SharedState { tx, persistence })
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Applies `change`, persists the result, then notifies subscribers.
    ///
    /// Nothing is saved or published when `change` leaves the value as it was.
    pub fn update<F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let current = self.get();
        let mut next = current.clone();
        change(&mut next);
        if next == current {
            return Ok(current);
        }

        self.persistence.save(&next)?;
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

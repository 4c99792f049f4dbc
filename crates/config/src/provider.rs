use std::{
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {serde_json::Value, tracing::info};

use crate::{
    env_subst::substitute_env_in_value,
    error::{Error, Result},
    loader::{load_config_value, load_raw_config_value, save_config_value},
};

/// Pull-based access to the host config document.
///
/// Channels call [`ConfigProvider::load`] on every inbound event so edits to
/// the document take effect without a restart.
pub trait ConfigProvider: Send + Sync {
    /// The current document with `${ENV}` placeholders resolved.
    fn load(&self) -> Result<Value>;

    /// The current document as stored, placeholders intact.
    fn load_raw(&self) -> Result<Value>;

    fn save(&self, value: &Value) -> Result<()>;

    /// Read-modify-write on the stored document.
    ///
    /// `apply` returns whether it changed anything; nothing is written
    /// otherwise. Returns that same flag.
    fn update(&self, apply: &mut dyn FnMut(&mut Value) -> bool) -> Result<bool> {
        let mut doc = self.load_raw()?;
        if !doc.is_object() {
            doc = Value::Object(Default::default());
        }
        if !apply(&mut doc) {
            return Ok(false);
        }
        self.save(&doc)?;
        Ok(true)
    }
}

/// Config document stored in a file.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<Value> {
        load_config_value(&self.path)
    }

    fn load_raw(&self) -> Result<Value> {
        load_raw_config_value(&self.path)
    }

    fn save(&self, value: &Value) -> Result<()> {
        save_config_value(&self.path, value)?;
        info!(path = %self.path.display(), "config updated");
        Ok(())
    }
}

/// In-process config document. Counts saves so callers can tell whether a
/// flow persisted anything.
#[derive(Debug, Default)]
pub struct MemoryConfigProvider {
    doc: Mutex<Value>,
    saves: AtomicUsize,
}

impl MemoryConfigProvider {
    pub fn new(doc: Value) -> Self {
        Self {
            doc: Mutex::new(doc),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful [`ConfigProvider::save`] calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Snapshot of the stored document.
    pub fn snapshot(&self) -> Value {
        self.doc.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn load(&self) -> Result<Value> {
        let mut doc = self.snapshot();
        substitute_env_in_value(&mut doc);
        Ok(doc)
    }

    fn load_raw(&self) -> Result<Value> {
        Ok(self.snapshot())
    }

    fn save(&self, value: &Value) -> Result<()> {
        if !value.is_object() {
            return Err(Error::NotAnObject);
        }
        *self.doc.lock().unwrap_or_else(|e| e.into_inner()) = value.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

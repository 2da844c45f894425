//! Hot-reloadable configuration handle.
//!
//! Readers take a cheap `Arc` snapshot with [`ConfigStore::current`]; a
//! command in flight keeps the snapshot it started with even if the file is
//! reloaded underneath it. A reload that fails validation leaves the previous
//! configuration active.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::error::ConfigResult;
use crate::schema::GatewayConfig;

#[derive(Debug)]
struct Loaded {
    config: Arc<GatewayConfig>,
    modified: Option<SystemTime>,
}

/// Shared, swappable view of the gateway configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    reserved: &'static [&'static str],
    inner: Arc<RwLock<Loaded>>,
}

impl ConfigStore {
    /// Load and validate the file at `path`.
    pub fn open(path: impl Into<PathBuf>, reserved: &'static [&'static str]) -> ConfigResult<Self> {
        let path = path.into();
        let config = GatewayConfig::from_file(&path, reserved)?;
        let modified = modified_time(&path);
        Ok(Self {
            path,
            reserved,
            inner: Arc::new(RwLock::new(Loaded {
                config: Arc::new(config),
                modified,
            })),
        })
    }

    /// Wrap an already-validated config with no backing file.
    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            path: PathBuf::new(),
            reserved: &[],
            inner: Arc::new(RwLock::new(Loaded {
                config: Arc::new(config),
                modified: None,
            })),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the active configuration.
    pub fn current(&self) -> Arc<GatewayConfig> {
        match self.inner.read() {
            Ok(guard) => guard.config.clone(),
            Err(poisoned) => poisoned.into_inner().config.clone(),
        }
    }

    /// Re-read the file unconditionally.
    ///
    /// On error the active configuration is kept and the error returned.
    pub fn reload(&self) -> ConfigResult<Arc<GatewayConfig>> {
        if self.path.as_os_str().is_empty() {
            return Ok(self.current());
        }
        let modified = modified_time(&self.path);
        let config = match GatewayConfig::from_file(&self.path, self.reserved) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload rejected, keeping previous");
                // Remember the mtime so a broken file is not re-parsed every poll.
                self.set_modified(modified);
                return Err(e);
            }
        };

        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.config = config.clone();
        guard.modified = modified;
        info!(
            path = %self.path.display(),
            tiers = config.tiers.len(),
            users = config.users.len(),
            "configuration reloaded"
        );
        Ok(config)
    }

    /// Reload only when the file's modification time moved.
    ///
    /// Returns `Ok(true)` when a new configuration was installed.
    pub fn reload_if_changed(&self) -> ConfigResult<bool> {
        if self.path.as_os_str().is_empty() {
            return Ok(false);
        }
        let modified = modified_time(&self.path);
        let previous = match self.inner.read() {
            Ok(guard) => guard.modified,
            Err(poisoned) => poisoned.into_inner().modified,
        };
        if modified.is_none() || modified == previous {
            return Ok(false);
        }
        self.reload().map(|_| true)
    }

    fn set_modified(&self, modified: Option<SystemTime>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.modified = modified;
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}


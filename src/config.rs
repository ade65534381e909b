//! Runtime configuration.
//!
//! The historical source kept several of these as package-level global
//! variables (a version override table, a cache-reverse-proxy URL, the
//! exploit's control-transfer timeout). Here they're an explicit struct
//! threaded through `flows`/`exploit`, persisted the same way
//! `blri::settings::BlriConfig` persists its own settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuhaxConfig {
    /// Control-transfer timeout used for the exploit's deliberately
    /// unacknowledged SETUP packet. See spec.md §9(c): the historical
    /// source does not pin an exact value, so it is a tunable here.
    pub exploit_timeout_ms: u64,
    /// Timeout budget for a single "wait for device to reappear" poll
    /// iteration during interface-kind switches.
    pub switch_poll_timeout_secs: u64,
    /// Directory used for the minimal on-disk cache contract (recovery
    /// files during `decrypt`, etc). Does not implement the out-of-scope
    /// upstream-download cache.
    pub cache_dir: PathBuf,
}

impl Default for DfuhaxConfig {
    fn default() -> Self {
        Self {
            exploit_timeout_ms: 5,
            switch_poll_timeout_secs: 30,
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("dfuhax")
}

impl DfuhaxConfig {
    pub fn exploit_timeout(&self) -> Duration {
        Duration::from_millis(self.exploit_timeout_ms)
    }

    pub fn switch_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_poll_timeout_secs)
    }

    fn settings_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".config").join("dfuhax.toml"))
    }

    /// Load configuration from `~/.config/dfuhax.toml`, falling back to
    /// defaults (and printing a one-line banner) if absent or unreadable.
    pub fn load() -> Self {
        if let Some(path) = Self::settings_path() {
            if path.exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(config) = toml::from_str::<DfuhaxConfig>(&content) {
                        tracing::info!(path = %path.display(), "loaded configuration");
                        return config;
                    }
                }
            }
        }
        tracing::info!("no configuration found, using defaults");
        Self::default()
    }

    pub fn save(&self) -> io::Result<()> {
        let path = Self::settings_path()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, content)
    }
}

/// Minimal on-disk cache FS contract (spec.md §6). Only a local-directory
/// implementation is provided; the memoising download layer itself is an
/// external collaborator and out of scope.
pub trait CacheStore {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()>;
    fn remove(&self, path: &str) -> io::Result<()>;
    fn exists(&self, path: &str) -> bool;
}

pub struct LocalDirCacheStore {
    root: PathBuf,
}

impl LocalDirCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl CacheStore for LocalDirCacheStore {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path);
        if full.exists() {
            fs::remove_file(full)
        } else {
            Ok(())
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}

/// Builds the `<device-kind>-<payload-kind>[-<sha256>].bin` cache key
/// described in spec.md §6.
pub fn cache_key(device_kind: &str, payload_kind: &str, url_sha256: Option<&str>) -> String {
    match url_sha256 {
        Some(hash) => format!("{device_kind}-{payload_kind}-{hash}.bin"),
        None => format!("{device_kind}-{payload_kind}.bin"),
    }
}

pub fn is_cache_path_well_formed(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("bin")
}

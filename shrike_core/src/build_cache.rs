//! A local cache of built engine binaries keyed by (configuration, revision).
//!
//! Layout: `<cache-dir>/<configuration>/<revision>/entry.json` plus whatever
//! the build provider writes next to it. `entry.json` decides what the key
//! holds; the presence of other files means nothing on its own.

use crate::config::BuildCacheSettings;
use crate::lock::{DirLock, LockError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const ENTRY_FILE: &str = "entry.json";
const ENTRY_TMP_FILE: &str = "entry.json.tmp";

/// What the cache knows about one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "kebab-case")]
pub enum CacheEntry {
    Absent,
    Present(PathBuf),
    /// Known not to build. Never retried.
    Busted(String),
}

#[derive(Error, Debug)]
pub enum BuildCacheError {
    #[error("build of {configuration}@{revision} failed: {reason}")]
    BuildFailed {
        configuration: String,
        revision: String,
        reason: String,
        /// Reported from a busted entry rather than a fresh attempt.
        cached: bool,
    },
    /// The build could not be attempted at all. Nothing is recorded.
    #[error("cannot build: {0}")]
    Environment(String),
    #[error("invalid cache key component '{0}'")]
    InvalidKey(String),
    #[error("remote tier error: {0}")]
    Remote(String),
    #[error("cache lock error: {0}")]
    Lock(#[from] LockError),
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache entry error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A build that did not produce an artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct BuildFailed {
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The revision does not build; remembered as busted.
    #[error(transparent)]
    Failed(#[from] BuildFailed),
    /// The provider itself is unusable (no command, missing tool).
    #[error("{0}")]
    Environment(String),
}

/// Builds one revision. Must leave nothing usable behind on failure.
pub trait BuildProvider: Send + Sync {
    /// Builds `revision` under `configuration` into `dest`, returning the
    /// artifact path.
    fn build(&self, configuration: &str, revision: &str, dest: &Path) -> Result<PathBuf, ProviderError>;
}

/// An optional shared tier consulted after the local cache misses.
pub trait RemoteTier: Send + Sync {
    /// Downloads and unpacks into `dest`. `Absent` when the remote has nothing.
    fn fetch(&self, configuration: &str, revision: &str, dest: &Path) -> Result<CacheEntry, BuildCacheError>;
    fn publish_present(&self, configuration: &str, revision: &str, artifact: &Path) -> Result<(), BuildCacheError>;
    fn publish_busted(&self, configuration: &str, revision: &str, reason: &str) -> Result<(), BuildCacheError>;
}

/// Runs an external build command template.
#[derive(Debug, Clone)]
pub struct CommandBuildProvider {
    template: Vec<String>,
}

impl CommandBuildProvider {
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }
}

impl BuildProvider for CommandBuildProvider {
    fn build(&self, configuration: &str, revision: &str, dest: &Path) -> Result<PathBuf, ProviderError> {
        let dest_str = dest.to_string_lossy();
        let argv: Vec<String> = self
            .template
            .iter()
            .map(|part| {
                part.replace("{configuration}", configuration)
                    .replace("{revision}", revision)
                    .replace("{dest}", &dest_str)
            })
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(ProviderError::Environment("no build command configured".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProviderError::Environment(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(ProviderError::from(BuildFailed {
                reason: format!(
                    "{program} exited with {}: {}",
                    output.status,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                ),
            }));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let artifact = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| BuildFailed {
                reason: format!("{program} did not print an artifact path"),
            })?;
        if !artifact.exists() {
            return Err(ProviderError::from(BuildFailed {
                reason: format!("artifact {artifact:?} does not exist"),
            }));
        }
        Ok(artifact)
    }
}

pub struct BuildCache {
    dir: PathBuf,
    provider: Box<dyn BuildProvider>,
    remote: Option<Box<dyn RemoteTier>>,
    lock_poll: Duration,
}

impl BuildCache {
    pub fn new(settings: &BuildCacheSettings, provider: Box<dyn BuildProvider>) -> Self {
        Self {
            dir: settings.cache_dir.clone(),
            provider,
            remote: None,
            lock_poll: Duration::from_millis(settings.lock_poll_ms),
        }
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteTier>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_dir(&self, configuration: &str, revision: &str) -> PathBuf {
        self.dir.join(configuration).join(revision)
    }

    fn lock(&self, configuration: &str) -> Result<DirLock, BuildCacheError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{configuration}.lock"));
        Ok(DirLock::acquire(path, self.lock_poll)?)
    }

    /// Current entry for a key. An unreadable entry, or one pointing at a
    /// missing artifact, reads as `Absent`.
    pub fn entry(&self, configuration: &str, revision: &str) -> Result<CacheEntry, BuildCacheError> {
        check_key(configuration)?;
        check_key(revision)?;
        self.read_entry(&self.entry_dir(configuration, revision), false)
    }

    fn read_entry(&self, entry_dir: &Path, repair: bool) -> Result<CacheEntry, BuildCacheError> {
        let path = entry_dir.join(ENTRY_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheEntry::Absent),
            Err(e) => return Err(e.into()),
        };
        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(CacheEntry::Present(artifact)) if !artifact.exists() => {
                warn!("cache entry {:?} points at missing artifact {:?}", path, artifact);
                None
            }
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("corrupt cache entry {:?}: {}", path, e);
                None
            }
        };
        match entry {
            Some(entry) => Ok(entry),
            None => {
                if repair {
                    fs::remove_dir_all(entry_dir)?;
                }
                Ok(CacheEntry::Absent)
            }
        }
    }

    fn write_entry(&self, entry_dir: &Path, entry: &CacheEntry) -> Result<(), BuildCacheError> {
        fs::create_dir_all(entry_dir)?;
        let tmp = entry_dir.join(ENTRY_TMP_FILE);
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        fs::rename(&tmp, entry_dir.join(ENTRY_FILE))?;
        Ok(())
    }

    fn touch(entry_dir: &Path) {
        let touched = File::options()
            .write(true)
            .open(entry_dir.join(ENTRY_FILE))
            .and_then(|f| f.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            debug!("could not refresh {:?}: {}", entry_dir, e);
        }
    }

    fn busted(configuration: &str, revision: &str, reason: String, cached: bool) -> BuildCacheError {
        BuildCacheError::BuildFailed {
            configuration: configuration.to_string(),
            revision: revision.to_string(),
            reason,
            cached,
        }
    }

    /// Returns the artifact for `(configuration, revision)`, building it at
    /// most once for the lifetime of the cache directory.
    pub fn obtain(&self, configuration: &str, revision: &str) -> Result<PathBuf, BuildCacheError> {
        check_key(configuration)?;
        check_key(revision)?;
        let entry_dir = self.entry_dir(configuration, revision);

        // Entries are written by rename, so an unlocked read is safe.
        match self.read_entry(&entry_dir, false)? {
            CacheEntry::Present(artifact) => {
                Self::touch(&entry_dir);
                return Ok(artifact);
            }
            CacheEntry::Busted(reason) => {
                return Err(Self::busted(configuration, revision, reason, true));
            }
            CacheEntry::Absent => {}
        }

        let _lock = self.lock(configuration)?;
        match self.read_entry(&entry_dir, true)? {
            CacheEntry::Present(artifact) => return Ok(artifact),
            CacheEntry::Busted(reason) => {
                return Err(Self::busted(configuration, revision, reason, true));
            }
            CacheEntry::Absent => {}
        }
        if entry_dir.exists() {
            debug!("clearing leftovers of an interrupted build in {:?}", entry_dir);
            fs::remove_dir_all(&entry_dir)?;
        }
        fs::create_dir_all(&entry_dir)?;

        if let Some(remote) = &self.remote {
            match remote.fetch(configuration, revision, &entry_dir) {
                Ok(CacheEntry::Present(artifact)) if artifact.exists() => {
                    info!("outcome=cache-remote-hit configuration={configuration} rev={revision}");
                    self.write_entry(&entry_dir, &CacheEntry::Present(artifact.clone()))?;
                    return Ok(artifact);
                }
                Ok(CacheEntry::Present(artifact)) => {
                    warn!("remote artifact {:?} failed verification, building locally", artifact);
                }
                Ok(CacheEntry::Busted(reason)) => {
                    self.write_entry(&entry_dir, &CacheEntry::Busted(reason.clone()))?;
                    return Err(Self::busted(configuration, revision, reason, true));
                }
                Ok(CacheEntry::Absent) => {}
                Err(e) => warn!("remote tier unavailable: {}", e),
            }
        }

        info!("building configuration={configuration} rev={revision}");
        match self.provider.build(configuration, revision, &entry_dir) {
            Ok(artifact) => {
                self.write_entry(&entry_dir, &CacheEntry::Present(artifact.clone()))?;
                if let Some(remote) = &self.remote {
                    if let Err(e) = remote.publish_present(configuration, revision, &artifact) {
                        warn!("failed to publish {configuration}@{revision}: {e}");
                    }
                }
                info!("outcome=built configuration={configuration} rev={revision}");
                Ok(artifact)
            }
            Err(ProviderError::Environment(reason)) => {
                // Leave the key absent so a fixed setup can build it later.
                fs::remove_dir_all(&entry_dir)?;
                warn!("outcome=build-unavailable configuration={configuration} rev={revision} reason={reason}");
                Err(BuildCacheError::Environment(reason))
            }
            Err(ProviderError::Failed(BuildFailed { reason })) => {
                self.write_entry(&entry_dir, &CacheEntry::Busted(reason.clone()))?;
                if let Some(remote) = &self.remote {
                    if let Err(e) = remote.publish_busted(configuration, revision, &reason) {
                        warn!("failed to publish busted {configuration}@{revision}: {e}");
                    }
                }
                info!("outcome=busted configuration={configuration} rev={revision}");
                Err(Self::busted(configuration, revision, reason, false))
            }
        }
    }

    /// Removes entries of `configuration` untouched for longer than
    /// `max_age`, holding the configuration's lock throughout.
    pub fn evict_older_than(&self, configuration: &str, max_age: Duration) -> Result<Vec<PathBuf>, BuildCacheError> {
        check_key(configuration)?;
        let config_dir = self.dir.join(configuration);
        if !config_dir.is_dir() {
            return Ok(Vec::new());
        }
        let _lock = self.lock(configuration)?;
        let now = SystemTime::now();
        let mut evicted = Vec::new();
        for dir_entry in fs::read_dir(&config_dir)? {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            let touched = fs::metadata(path.join(ENTRY_FILE))
                .or_else(|_| fs::metadata(&path))?
                .modified()?;
            let age = now.duration_since(touched).unwrap_or_default();
            if age > max_age {
                debug!("evicting {:?} (age {:?})", path, age);
                fs::remove_dir_all(&path)?;
                evicted.push(path);
            }
        }
        Ok(evicted)
    }

    /// Runs [`Self::evict_older_than`] for every configuration in the cache.
    pub fn evict_all(&self, max_age: Duration) -> Result<Vec<PathBuf>, BuildCacheError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut configurations = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if dir_entry.path().is_dir() && !name.ends_with(".lock") && !name.contains(".stale-") {
                configurations.push(name);
            }
        }
        let mut evicted = Vec::new();
        for configuration in configurations {
            evicted.extend(self.evict_older_than(&configuration, max_age)?);
        }
        info!("outcome=evicted count={}", evicted.len());
        Ok(evicted)
    }
}

fn check_key(component: &str) -> Result<(), BuildCacheError> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
        || component.ends_with(".lock");
    if bad {
        return Err(BuildCacheError::InvalidKey(component.to_string()));
    }
    Ok(())
}

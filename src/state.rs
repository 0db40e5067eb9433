//! Shared application state and the live-session registry.

use crate::config::ServerConfig;
use crate::format::Formatters;
use crate::sandbox;
use crate::workspace::Language;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::info;

/// A launched process that can still be stopped.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub pid: Pid,
    pub pty_fd: RawFd,
    pub workspace: PathBuf,
    pub language: Language,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Killed,
    NotRunning,
}

/// Session id → live process. An entry exists only between launch and
/// teardown; the relay owning the session stays authoritative for its state.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<Mutex<HashMap<String, RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        // Entries are plain data, a panic elsewhere cannot leave them half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a launched process. Returns `false` if `id` is already live.
    pub fn register(&self, id: &str, entry: RegistryEntry) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_string(), entry);
        true
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Drop the entry for `id` only if it still records `pid`, so a session
    /// refused as a duplicate never evicts the live one.
    pub fn release(&self, id: &str, pid: Pid) -> bool {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if entry.pid == pid => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Kill the process recorded for `id` and forget it.
    ///
    /// The signal is sent while the lock is held, so the owning relay (which
    /// removes the entry before reaping) can never have reaped this pid yet.
    pub fn stop(&self, id: &str) -> StopOutcome {
        let mut entries = self.lock();
        match entries.remove(id) {
            Some(entry) => {
                sandbox::kill_group(entry.pid);
                info!(session = %id, pid = entry.pid.as_raw(), "Session stopped");
                StopOutcome::Killed
            }
            None => StopOutcome::NotRunning,
        }
    }

    pub fn snapshot(&self) -> Vec<(String, RegistryEntry)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub config: Arc<ServerConfig>,
    pub formatters: Formatters,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            config: Arc::new(config),
            formatters: Formatters::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Whether a presented token satisfies the configured shared secret.
    pub fn token_ok(&self, presented: Option<&str>) -> bool {
        match self.config.token.as_deref() {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

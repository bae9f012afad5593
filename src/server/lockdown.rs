//! Failed-login throttling. Subjects (source IPs or tokens, depending on
//! the configured mode) accumulate failed attempts; once a subject
//! reaches the limit it is locked until its cooldown window expires.
//! State persists in a JSON sidecar file so bans survive restarts.

use crate::config::LockdownMode;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One subject's record. time is the unix-millisecond expiry of the
/// current cooldown window; attempts is the cumulative failure count.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    time: u64,
    attempts: u32,
}

/// The lockdown tracker. All mutations happen under the entry mutex, and
/// the sidecar is rewritten (atomically, via a temp file) under that same
/// lock.
pub struct Lockdown {
    mode: LockdownMode,
    max_attempts: u32,
    cooldown: Duration,
    path: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Lockdown {
    /// Creates a tracker, loading any persisted state from the sidecar. A
    /// corrupt sidecar logs a warning and starts empty.
    pub fn load(mode: LockdownMode, max_attempts: u32, cooldown: Duration, path: PathBuf) -> Self {
        let mut entries = HashMap::new();
        if path.exists() {
            match std::fs::read(&path).map_err(crate::error::Error::from).and_then(|bytes| {
                serde_json::from_slice::<HashMap<String, Entry>>(&bytes).map_err(Into::into)
            }) {
                Ok(loaded) => entries = loaded,
                Err(err) => log::warn!("Ignoring corrupt lockdown file {}: {err}", path.display()),
            }
        }
        Self { mode, max_attempts, cooldown, path, entries: Mutex::new(entries) }
    }

    /// Returns the lockdown subject for a connection: the source IP in ip
    /// mode, the presented token in token mode, and None when lockdown is
    /// disabled.
    pub fn subject(&self, ip: &std::net::IpAddr, token: &str) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        match self.mode {
            LockdownMode::Ip => Some(ip.to_string()),
            LockdownMode::Token => Some(token.to_string()),
            LockdownMode::None => None,
        }
    }

    /// Returns true if the subject is currently locked down.
    pub fn is_locked_down(&self, subject: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(subject) {
            Some(entry) => entry.attempts >= self.max_attempts && now_millis() <= entry.time,
            None => false,
        }
    }

    /// Records a failed attempt: increments the subject's counter, extends
    /// its cooldown window, and rewrites the sidecar.
    pub fn record_failure(&self, subject: &str) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(subject.to_string()).or_insert(Entry { time: 0, attempts: 0 });
        entry.attempts += 1;
        entry.time = now_millis() + self.cooldown.as_millis() as u64;
        self.save(&entries)
    }

    fn enabled(&self) -> bool {
        self.max_attempts > 0 && self.mode != LockdownMode::None
    }

    /// Rewrites the sidecar via a temp file and rename. When no subject is
    /// currently locked the file is removed instead.
    fn save(&self, entries: &HashMap<String, Entry>) -> Result<()> {
        let now = now_millis();
        let any_locked =
            entries.values().any(|e| e.attempts >= self.max_attempts && now <= e.time);
        if !any_locked {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! The store: in-memory lookup tables over sharded record files, with a
//! change log for durability. All mutations go through a single owner (the
//! server wraps the store in one mutex), so the tables never expose an
//! intermediate state.

use super::aol::{self, Aol, Line, Op};
use super::file::{Header, RecordFile};
use crate::encoding::{self, Value};
use crate::error::Result;

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Slot metadata for a live key.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    /// The shard holding the entry.
    pub shard: usize,
    /// The key digest.
    pub digest: [u8; 32],
    /// The encoded value length in bytes.
    pub size: u32,
    /// Byte offset of the record in the shard's key file, or -1 while the
    /// entry only exists in memory and the change log.
    pub position: i64,
    /// Full record length: digest (32) + size field (4) + value size.
    pub length: u32,
}

/// A reclaimable slot left behind by a removed entry. The write path
/// currently always appends; the free list feeds the future compactor.
#[derive(Clone, Debug, PartialEq)]
pub struct FreeSlot {
    pub shard: usize,
    pub size: u32,
    pub position: i64,
    pub length: u32,
}

/// The result of a set operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SetOutcome {
    Failed = 0,
    Updated = 1,
    Inserted = 2,
}

impl SetOutcome {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Round-robin assignment of new keys to shards.
struct ShardSelector {
    counter: u64,
    shards: usize,
}

impl ShardSelector {
    fn new(shards: usize) -> Self {
        Self { counter: 0, shards }
    }

    /// Advances the counter and returns the next shard index.
    fn next(&mut self) -> usize {
        let shard = (self.counter % self.shards as u64) as usize;
        self.counter += 1;
        shard
    }
}

/// One shard: a data file and its companion key file. A shard whose files
/// were found faint at startup is inactive: it keeps its round-robin
/// position but is skipped by bootstrap and persist.
struct Shard {
    files: Option<(RecordFile, RecordFile)>,
}

/// Store creation options.
pub struct StoreOptions {
    /// The 8-byte deployment signature written to file headers.
    pub signature: [u8; 8],
    /// Number of shards.
    pub shards: usize,
    /// Unix permission bits for created shard files.
    pub permission: u32,
    /// Per-entry encoded size limit in bytes, 0 for unlimited.
    pub entry_limit: u64,
    /// Total in-memory size cap in bytes, 0 for unlimited.
    pub memory_limit: u64,
    /// Whether mutations are persisted to the change log.
    pub persistent: bool,
    /// Change log rotation size in bytes, 0 for unlimited.
    pub backup_limit: u64,
    /// Change log flush interval.
    pub flush_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            signature: *b"SFDB0001",
            shards: 4,
            permission: 0o644,
            entry_limit: 0,
            memory_limit: 0,
            persistent: true,
            backup_limit: 0,
            flush_interval: aol::FLUSH_INTERVAL,
        }
    }
}

/// Engine statistics, as reported by the shell's info command.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Status {
    pub keys: u64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub entry_limit: u64,
    pub shards: u64,
    pub active_shards: u64,
    pub disk_size: u64,
    pub free_slots: u64,
    pub persistent: bool,
}

/// The key/value store.
pub struct Store {
    dir: PathBuf,
    shards: Vec<Shard>,
    selector: ShardSelector,
    /// Key → slot metadata. Presence means the key is live.
    by_key: HashMap<String, Slot>,
    /// Hex digest → current value.
    by_digest: HashMap<String, Value>,
    /// Free slots left by removed entries, in removal order.
    free: Vec<FreeSlot>,
    /// Key → digest memoization, bounded by the live key set.
    digests: HashMap<String, [u8; 32]>,
    memory_used: u64,
    entry_limit: u64,
    memory_limit: u64,
    aol: Option<Aol>,
}

impl Store {
    /// Opens or creates a store in the given directory: validates or
    /// creates the shard files, bootstraps the tables from their records,
    /// replays the change log on top, and finally starts the change log
    /// writer.
    pub fn open(dir: PathBuf, options: StoreOptions) -> Result<Self> {
        log::info!("Opening database {}", dir.display());
        std::fs::create_dir_all(&dir)?;

        let reference = Header::new(options.signature);
        let mut shards = Vec::with_capacity(options.shards);
        for i in 0..options.shards {
            let data =
                RecordFile::open(dir.join(format!("meid-{i}.sfd")), &reference, options.permission)?;
            let keys =
                RecordFile::open(dir.join(format!("key-{i}.sfk")), &reference, options.permission)?;
            let files = match (data, keys) {
                (Some(data), Some(keys)) => Some((data, keys)),
                _ => {
                    log::warn!("Shard {i} is inactive");
                    None
                }
            };
            shards.push(Shard { files });
        }

        let mut store = Self {
            dir,
            selector: ShardSelector::new(options.shards),
            shards,
            by_key: HashMap::new(),
            by_digest: HashMap::new(),
            free: Vec::new(),
            digests: HashMap::new(),
            memory_used: 0,
            entry_limit: options.entry_limit,
            memory_limit: options.memory_limit,
            aol: None,
        };
        store.bootstrap()?;
        store.replay()?;
        if options.persistent {
            store.aol = Some(Aol::start(
                store.dir.clone(),
                options.backup_limit,
                options.flush_interval,
            )?);
        }
        log::info!("Indexed {} live keys in {}", store.by_key.len(), store.dir.display());
        Ok(store)
    }

    /// Sets a key to a value, logging the mutation to the change log.
    pub fn set(&mut self, key: &str, value: Value) -> SetOutcome {
        self.apply_set(key, value, true)
    }

    /// Returns the value for a key, if it is live.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = sanitize_key(key, false);
        let slot = self.by_key.get(&key)?;
        self.by_digest.get(&hex::encode(slot.digest))
    }

    /// Removes a key, pushing its slot onto the free list and logging the
    /// mutation. Returns false if the key was not live.
    pub fn remove(&mut self, key: &str) -> bool {
        self.apply_remove(key, true)
    }

    /// Returns true if the key is live.
    pub fn exist(&self, key: &str) -> bool {
        self.by_key.contains_key(&sanitize_key(key, false))
    }

    /// Returns the slot metadata for a key, if it is live.
    pub fn slot(&self, key: &str) -> Option<&Slot> {
        self.by_key.get(&sanitize_key(key, false))
    }

    /// Returns the smallest free slot that fits size bytes, anticipating
    /// hole-reusing compaction. The free list is unordered, so candidates
    /// are sorted by size and the fit found by binary search.
    pub fn best_fit(&self, size: u32) -> Option<&FreeSlot> {
        let mut candidates: Vec<&FreeSlot> = self.free.iter().collect();
        candidates.sort_by_key(|slot| slot.size);
        let i = candidates.partition_point(|slot| slot.size < size);
        candidates.get(i).copied()
    }

    /// Engine statistics.
    pub fn status(&self) -> Result<Status> {
        let mut disk_size = 0;
        let mut active_shards = 0;
        for shard in &self.shards {
            if let Some((data, keys)) = &shard.files {
                disk_size += data.size()? + keys.size()?;
                active_shards += 1;
            }
        }
        Ok(Status {
            keys: self.by_key.len() as u64,
            memory_used: self.memory_used,
            memory_limit: self.memory_limit,
            entry_limit: self.entry_limit,
            shards: self.shards.len() as u64,
            active_shards,
            disk_size,
            free_slots: self.free.len() as u64,
            persistent: self.aol.is_some(),
        })
    }

    /// Appends every entry not yet present in its shard files and records
    /// the new key file offset. Called on graceful shutdown. Updated
    /// values keep their original offset; the change log carries them.
    pub fn persist(&mut self) -> Result<()> {
        let mut persisted = 0;
        for (key, slot) in self.by_key.iter_mut() {
            if slot.position >= 0 {
                continue;
            }
            let Some((data, keys)) = &mut self.shards[slot.shard].files else {
                continue;
            };
            let Some(value) = self.by_digest.get(&hex::encode(slot.digest)) else {
                continue;
            };
            let bytes = encoding::encode(value)?;
            data.append(&slot.digest, &bytes)?;
            let position = keys.append(&slot.digest, key.as_bytes())?;
            slot.position = position as i64;
            persisted += 1;
        }
        for shard in &mut self.shards {
            if let Some((data, keys)) = &mut shard.files {
                data.sync()?;
                keys.sync()?;
            }
        }
        if persisted > 0 {
            log::info!("Persisted {persisted} entries to shard files");
        }
        Ok(())
    }

    /// Loads existing shard records into the tables. Key files are
    /// verified against their digests; a corrupt record stops that file's
    /// scan but keeps everything before it and everything in other shards.
    fn bootstrap(&mut self) -> Result<()> {
        let mut entries = Vec::new();
        for (i, shard) in self.shards.iter_mut().enumerate() {
            let Some((data, keys)) = &mut shard.files else {
                continue;
            };
            let mut key_records = HashMap::new();
            let result = keys.scan(true, |digest, payload, position| {
                key_records.insert(digest, (String::from_utf8(payload)?, position));
                Ok(())
            });
            if let Err(err) = result {
                log::warn!("Key scan of shard {i} stopped: {err}");
            }
            let mut values = HashMap::new();
            let result = data.scan(false, |digest, payload, _| {
                values.insert(digest, payload);
                Ok(())
            });
            if let Err(err) = result {
                log::warn!("Record scan of shard {i} stopped: {err}");
            }
            for (digest, (key, position)) in key_records {
                let Some(bytes) = values.remove(&digest) else {
                    continue;
                };
                entries.push((i, digest, key, position, bytes));
            }
        }
        for (shard, digest, key, position, bytes) in entries {
            let value = match encoding::decode(&bytes) {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("Discarding undecodable record for {key}: {err}");
                    continue;
                }
            };
            self.install(key, digest, value, shard, bytes.len() as u32, position as i64);
        }
        Ok(())
    }

    /// Replays the change log files in order. Failures are per file: a
    /// file that cannot be read or parsed is skipped with a warning.
    fn replay(&mut self) -> Result<()> {
        for path in aol::list_files(&self.dir)? {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    log::warn!("Skipping change log {}: {err}", path.display());
                    continue;
                }
            };
            let lines = match aol::parse_content(&content) {
                Ok(lines) => lines,
                Err(err) => {
                    log::warn!("Skipping change log {}: {err}", path.display());
                    continue;
                }
            };
            for line in lines {
                match line {
                    Line::Set { keys, value } => {
                        for key in keys {
                            self.apply_set(&key, value.clone(), false);
                        }
                    }
                    Line::Remove { keys } => {
                        for key in keys {
                            self.apply_remove(&key, false);
                        }
                    }
                }
            }
            log::info!("Replayed change log {}", path.display());
        }
        Ok(())
    }

    /// The set path. Replay suppresses change log re-logging (log_op =
    /// false) but still sanitizes. Cap checks happen before any mutation,
    /// so a failed set leaves no partial state.
    fn apply_set(&mut self, key: &str, value: Value, log_op: bool) -> SetOutcome {
        let key = sanitize_key(key, false);
        if key.is_empty() {
            return SetOutcome::Failed;
        }
        let value = sanitize_value(value);
        let Ok(bytes) = encoding::encode(&value) else {
            return SetOutcome::Failed;
        };
        let size = bytes.len() as u64;
        if size > (u32::MAX - 36) as u64 {
            return SetOutcome::Failed;
        }
        if self.entry_limit > 0 && size > self.entry_limit {
            return SetOutcome::Failed;
        }
        let new_total = match self.by_key.get(&key) {
            Some(slot) => self.memory_used - slot.size as u64 + size,
            None => self.memory_used + size + key.len() as u64,
        };
        if self.memory_limit > 0 && new_total > self.memory_limit {
            return SetOutcome::Failed;
        }

        let op_value = (log_op && self.aol.is_some()).then(|| value.clone());
        let digest = self.digest_for(&key);
        let outcome = match self.by_key.get_mut(&key) {
            Some(slot) => {
                slot.size = size as u32;
                slot.length = 36 + size as u32;
                self.by_digest.insert(hex::encode(digest), value);
                SetOutcome::Updated
            }
            None => {
                let shard = self.selector.next();
                self.by_key.insert(
                    key.clone(),
                    Slot { shard, digest, size: size as u32, position: -1, length: 36 + size as u32 },
                );
                self.by_digest.insert(hex::encode(digest), value);
                SetOutcome::Inserted
            }
        };
        self.memory_used = new_total;

        if let (Some(aol), Some(value)) = (&self.aol, op_value) {
            aol.enqueue(Op::Set { key, value });
        }
        outcome
    }

    /// The remove path, with the same replay suppression as apply_set.
    fn apply_remove(&mut self, key: &str, log_op: bool) -> bool {
        let key = sanitize_key(key, false);
        let Some(slot) = self.by_key.remove(&key) else {
            return false;
        };
        self.free.push(FreeSlot {
            shard: slot.shard,
            size: slot.size,
            position: slot.position,
            length: slot.length,
        });
        self.by_digest.remove(&hex::encode(slot.digest));
        self.digests.remove(&key);
        self.memory_used = self.memory_used.saturating_sub(slot.size as u64 + key.len() as u64);
        if log_op {
            if let Some(aol) = &self.aol {
                aol.enqueue(Op::Remove { key });
            }
        }
        true
    }

    /// Installs a bootstrapped entry, replacing any earlier record for the
    /// same key.
    fn install(
        &mut self,
        key: String,
        digest: [u8; 32],
        value: Value,
        shard: usize,
        size: u32,
        position: i64,
    ) {
        if let Some(old) = self.by_key.get(&key) {
            self.memory_used =
                self.memory_used.saturating_sub(old.size as u64 + key.len() as u64);
        }
        self.memory_used += size as u64 + key.len() as u64;
        self.by_digest.insert(hex::encode(digest), value);
        self.digests.insert(key.clone(), digest);
        self.by_key.insert(key, Slot { shard, digest, size, position, length: 36 + size });
    }

    fn digest_for(&mut self, key: &str) -> [u8; 32] {
        if let Some(digest) = self.digests.get(key) {
            return *digest;
        }
        let digest = encoding::digest(key.as_bytes());
        self.digests.insert(key.to_string(), digest);
        digest
    }
}

/// Attempt to persist unflushed entries when the store is closed. The
/// change log handle drains separately via its own Drop.
impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.persist() {
            log::error!("failed to persist shard files: {err}");
        }
    }
}

/// Sanitizes a key: whitespace runs collapse to a single underscore and
/// any other character outside `[A-Za-z0-9_-]` is stripped. With trim,
/// leading and trailing underscores are removed.
pub fn sanitize_key(key: &str, trim: bool) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_whitespace = false;
    for c in key.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
        } else {
            in_whitespace = false;
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                out.push(c);
            }
        }
    }
    if trim {
        out.trim_matches('_').to_string()
    } else {
        out
    }
}

/// Sanitizes a value before storage. Currently the identity function, kept
/// as the seam where value normalization will live.
pub fn sanitize_value(value: Value) -> Value {
    value
}

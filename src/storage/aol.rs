//! The append-only change log (AOL). Mutations are queued to a dedicated
//! writer thread over a bounded channel, coalesced by key, and flushed to
//! a textual log file every few seconds. Files are named
//! `<unix_seconds>.sfb` and rotated by size; the engine never deletes
//! them. On startup the files are replayed in name order to rebuild the
//! in-memory state.
//!
//! The durability contract: an acknowledged mutation will eventually
//! appear in some file, but a crash may lose the last flush interval of
//! writes. A partially written trailing line is ignored on replay.

use crate::encoding::Value;
use crate::errdata;
use crate::error::Result;

use crossbeam::channel::{Receiver, Sender};
use fs4::fs_std::FileExt;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long the default flush timer waits between drains.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// How long enqueue blocks on a full channel before dropping the op.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(250);

/// Queued op capacity. The writer drains continuously, so the channel only
/// fills when the disk stalls for a sustained burst of mutations.
const CHANNEL_CAPACITY: usize = 1024;

/// A mutation shipped to the change log writer.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Set { key: String, value: Value },
    Remove { key: String },
}

/// One logical change parsed from a log line. A set line may carry several
/// keys sharing the same value.
#[derive(Clone, Debug, PartialEq)]
pub enum Line {
    Set { keys: Vec<String>, value: Value },
    Remove { keys: Vec<String> },
}

/// A handle to the change log writer thread. Dropping the handle signals
/// the writer, which drains outstanding ops, flushes, and exits; the
/// thread is then joined.
pub struct Aol {
    tx: Option<Sender<Op>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Aol {
    /// Starts the change log writer for the given database directory.
    /// size_limit rotates files when they would grow beyond it, 0 disables
    /// rotation.
    pub fn start(dir: PathBuf, size_limit: u64, flush_interval: Duration) -> Result<Self> {
        let last_timestamp = latest_timestamp(&dir)?;
        let (tx, rx) = crossbeam::channel::bounded(CHANNEL_CAPACITY);
        let ticker = crossbeam::channel::tick(flush_interval);
        let writer = Writer {
            dir,
            size_limit,
            last_timestamp,
            queue: BTreeMap::new(),
            dirty: false,
            file: None,
        };
        let thread = std::thread::spawn(move || writer.run(rx, ticker));
        Ok(Self { tx: Some(tx), thread: Some(thread) })
    }

    /// Queues a mutation for the next flush. Blocks briefly when the
    /// channel is full, then drops the op with a logged error; the
    /// durability contract already tolerates losing the tail of writes.
    pub fn enqueue(&self, op: Op) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.send_timeout(op, ENQUEUE_TIMEOUT) {
            log::error!("Change log rejected mutation: {err}");
        }
    }
}

impl Drop for Aol {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Change log writer panicked");
            }
        }
    }
}

/// The writer side, owned by the log thread. The queue coalesces by key:
/// repeated mutations of one key between flushes keep only the latest.
struct Writer {
    dir: PathBuf,
    size_limit: u64,
    last_timestamp: u64,
    queue: BTreeMap<String, Pending>,
    dirty: bool,
    file: Option<OpenFile>,
}

enum Pending {
    Set(Value),
    Remove,
}

struct OpenFile {
    file: std::fs::File,
    path: PathBuf,
}

impl Writer {
    fn run(mut self, rx: Receiver<Op>, ticker: Receiver<std::time::Instant>) {
        loop {
            crossbeam::select! {
                recv(rx) -> op => match op {
                    Ok(op) => self.buffer(op),
                    // All senders gone: drain and exit.
                    Err(_) => {
                        if self.dirty {
                            if let Err(err) = self.flush() {
                                log::error!("Final change log flush failed: {err}");
                            }
                        }
                        return;
                    }
                },
                recv(ticker) -> _ => {
                    if self.dirty {
                        if let Err(err) = self.flush() {
                            // The queue and dirty flag are kept, so the
                            // next tick retries.
                            log::error!("Change log flush failed, will retry: {err}");
                        }
                    }
                }
            }
        }
    }

    fn buffer(&mut self, op: Op) {
        match op {
            Op::Set { key, value } => self.queue.insert(key, Pending::Set(value)),
            Op::Remove { key } => self.queue.insert(key, Pending::Remove),
        };
        self.dirty = true;
    }

    /// Drains the queue into the current file, grouping sets that share a
    /// stringified value into one line. The queue is only cleared once the
    /// batch has been written.
    fn flush(&mut self) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        let mut removes = Vec::new();
        for (key, pending) in &self.queue {
            match pending {
                Pending::Set(value) => groups.entry(stringify(value)).or_default().push(key),
                Pending::Remove => removes.push(format!("#{key}")),
            }
        }
        let mut batch = String::new();
        for (value, keys) in groups {
            batch.push_str(&keys.join("<"));
            batch.push('<');
            batch.push_str(&value);
            batch.push('\n');
        }
        if !removes.is_empty() {
            batch.push_str(&removes.join(" "));
            batch.push('\n');
        }
        if !batch.is_empty() {
            self.write(batch.as_bytes())?;
        }
        self.queue.clear();
        self.dirty = false;
        Ok(())
    }

    fn write(&mut self, batch: &[u8]) -> Result<()> {
        // Rotate when this write would grow the file beyond the limit.
        if let Some(open) = &self.file {
            if self.size_limit > 0
                && open.file.metadata()?.len() + batch.len() as u64 > self.size_limit
            {
                log::info!("Rotating change log {}", open.path.display());
                self.file = None;
            }
        }
        if self.file.is_none() {
            // Never reuse or precede an existing filename, even when
            // rotating twice within one second.
            let timestamp = std::cmp::max(super::unix_seconds(), self.last_timestamp + 1);
            let path = self.dir.join(format!("{timestamp}.sfb"));
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.try_lock_exclusive()?;
            self.last_timestamp = timestamp;
            log::info!("Opened change log {}", path.display());
            self.file = Some(OpenFile { file, path });
        }
        let Some(open) = &mut self.file else {
            return Ok(());
        };
        open.file.write_all(batch)?;
        #[cfg(not(test))]
        open.file.sync_data()?;
        Ok(())
    }
}

/// Stringifies a value for a change log line: `N` for nil, `T`/`F` for
/// booleans, JSON for everything else (numbers keep their natural decimal
/// form through JSON).
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Nil => "N".to_string(),
        Value::Bool(true) => "T".to_string(),
        Value::Bool(false) => "F".to_string(),
        value => value.to_json().to_string(),
    }
}

/// Parses a stringified change log value.
pub fn parse_value(input: &str) -> Result<Value> {
    match input {
        "N" => Ok(Value::Nil),
        "T" => Ok(Value::Bool(true)),
        "F" => Ok(Value::Bool(false)),
        input => Ok(Value::from_json(serde_json::from_str(input)?)),
    }
}

/// Parses one change log line. Blank lines and `;` comments yield None.
///
/// Set lines are `key1<key2<…<value`. Keys are sanitized identifiers over
/// `[A-Za-z0-9_-]` and can never contain `<`, so the leading key-shaped
/// segments (always leaving at least one trailing segment) are keys and
/// the remainder, rejoined on `<`, is the value. Remove lines are
/// `#key1 #key2 …`.
pub fn parse_line(line: &str) -> Result<Option<Line>> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return Ok(None);
    }

    if trimmed.starts_with('#') {
        let mut keys = Vec::new();
        for token in trimmed.split_whitespace() {
            match token.strip_prefix('#') {
                Some(key) if !key.is_empty() => keys.push(key.to_string()),
                _ => return errdata!("malformed remove line {line:?}"),
            }
        }
        return Ok(Some(Line::Remove { keys }));
    }

    let segments: Vec<&str> = line.split('<').collect();
    if segments.len() < 2 {
        return errdata!("malformed change log line {line:?}");
    }
    let mut split = 0;
    while split < segments.len() - 1 && is_key(segments[split]) {
        split += 1;
    }
    if split == 0 {
        return errdata!("change log line {line:?} has no keys");
    }
    let keys = segments[..split].iter().map(|s| s.to_string()).collect();
    let value = parse_value(&segments[split..].join("<"))?;
    Ok(Some(Line::Set { keys, value }))
}

fn is_key(segment: &str) -> bool {
    !segment.is_empty()
        && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Parses a change log file's content. A trailing line without its `\n`
/// terminator is a crashed partial flush and is ignored. Any other
/// malformed line fails the whole file, so the caller skips it.
pub fn parse_content(content: &str) -> Result<Vec<Line>> {
    let content = match content.ends_with('\n') {
        true => content,
        false => &content[..content.rfind('\n').map(|i| i + 1).unwrap_or(0)],
    };
    let mut lines = Vec::new();
    for line in content.lines() {
        if let Some(line) = parse_line(line)? {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Returns the change log files in the directory in replay order
/// (lexicographic by name, which is chronological for the fixed-width
/// timestamps in use).
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = Regex::new(r"^\d+\.sfb$")?;
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if pattern.is_match(name) {
                files.push((name.to_string(), entry.path()));
            }
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Returns the newest change log timestamp in the directory, or 0.
fn latest_timestamp(dir: &Path) -> Result<u64> {
    let mut latest = 0;
    for path in list_files(dir)? {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(timestamp) = stem.parse::<u64>() {
                latest = std::cmp::max(latest, timestamp);
            }
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn tempdir() -> tempfile::TempDir {
        tempfile::TempDir::with_prefix("sfdb").expect("tempdir failed")
    }

    #[test_case(Value::Nil, "N"; "nil")]
    #[test_case(Value::Bool(true), "T"; "bool_true")]
    #[test_case(Value::Bool(false), "F"; "bool_false")]
    #[test_case(Value::Int(42), "42"; "int")]
    #[test_case(Value::Int(-7), "-7"; "negative int")]
    #[test_case(Value::Float(2.5), "2.5"; "float")]
    #[test_case(Value::Float(5.0), "5.0"; "integral float keeps its point")]
    #[test_case(Value::Str("hello".into()), "\"hello\""; "string")]
    #[test_case(Value::Str("a<b".into()), "\"a<b\""; "string with separator")]
    #[test_case(Value::Seq(vec![Value::Int(1), Value::Nil]), "[1,null]"; "seq")]
    fn value_roundtrip(value: Value, expect: &str) {
        let s = stringify(&value);
        assert_eq!(s, expect);
        assert_eq!(parse_value(&s).unwrap(), value);
    }

    #[test]
    fn map_roundtrip() {
        let value = Value::Map(BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Str("x".into())),
        ]));
        assert_eq!(parse_value(&stringify(&value)).unwrap(), value);
    }

    #[test]
    fn parse_set_lines() {
        assert_eq!(
            parse_line("k1<\"v1\"").unwrap(),
            Some(Line::Set { keys: vec!["k1".into()], value: Value::Str("v1".into()) })
        );
        assert_eq!(
            parse_line("k1<k2<5").unwrap(),
            Some(Line::Set { keys: vec!["k1".into(), "k2".into()], value: Value::Int(5) })
        );
        // A value containing the separator still parses unambiguously.
        assert_eq!(
            parse_line("k1<\"a<b\"").unwrap(),
            Some(Line::Set { keys: vec!["k1".into()], value: Value::Str("a<b".into()) })
        );
        // Numeric values are key-shaped but the last segment is never a key.
        assert_eq!(
            parse_line("k<123").unwrap(),
            Some(Line::Set { keys: vec!["k".into()], value: Value::Int(123) })
        );
    }

    #[test]
    fn parse_remove_lines() {
        assert_eq!(
            parse_line("#k1 #k2").unwrap(),
            Some(Line::Remove { keys: vec!["k1".into(), "k2".into()] })
        );
    }

    #[test_case(""; "blank")]
    #[test_case("   "; "whitespace")]
    #[test_case("; a comment"; "comment")]
    fn parse_ignored_lines(line: &str) {
        assert_eq!(parse_line(line).unwrap(), None);
    }

    #[test_case("justakey"; "no separator")]
    #[test_case("<5"; "no keys")]
    #[test_case("k1<notjson"; "bad value")]
    #[test_case("# "; "empty remove")]
    fn parse_errors(line: &str) {
        assert!(matches!(parse_line(line), Err(Error::InvalidData(_))));
    }

    #[test]
    fn content_drops_unterminated_tail() {
        let content = "a<1\nb<2\nc<\"par";
        let lines = parse_content(content).unwrap();
        assert_eq!(
            lines,
            vec![
                Line::Set { keys: vec!["a".into()], value: Value::Int(1) },
                Line::Set { keys: vec!["b".into()], value: Value::Int(2) },
            ]
        );
    }

    #[test]
    fn file_listing_is_ordered() {
        let dir = tempdir();
        for name in ["1700000002.sfb", "1700000000.sfb", "1700000001.sfb", "notalog.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let names: Vec<String> = list_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["1700000000.sfb", "1700000001.sfb", "1700000002.sfb"]);
        assert_eq!(latest_timestamp(dir.path()).unwrap(), 1700000002);
    }

    /// Repeated sets of one key within a flush interval must persist as a
    /// single line carrying the latest value.
    #[test]
    fn coalescing() {
        let dir = tempdir();
        let aol = Aol::start(dir.path().to_path_buf(), 0, Duration::from_secs(60)).unwrap();
        for value in ["v1", "v2", "v3"] {
            aol.enqueue(Op::Set { key: "k".into(), value: Value::Str(value.into()) });
        }
        aol.enqueue(Op::Set { key: "other".into(), value: Value::Str("v3".into()) });
        aol.enqueue(Op::Remove { key: "gone".into() });
        drop(aol); // final drain

        let files = list_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content, "k<other<\"v3\"\n#gone\n");
    }

    /// A set followed by a remove of the same key coalesces to the remove.
    #[test]
    fn coalescing_set_then_remove() {
        let dir = tempdir();
        let aol = Aol::start(dir.path().to_path_buf(), 0, Duration::from_secs(60)).unwrap();
        aol.enqueue(Op::Set { key: "k".into(), value: Value::Int(1) });
        aol.enqueue(Op::Remove { key: "k".into() });
        drop(aol);

        let files = list_files(dir.path()).unwrap();
        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content, "#k\n");
    }

    #[test]
    fn rotation() {
        let dir = tempdir();
        let aol = Aol::start(dir.path().to_path_buf(), 8, Duration::from_millis(25)).unwrap();
        aol.enqueue(Op::Set { key: "first".into(), value: Value::Int(1) });
        std::thread::sleep(Duration::from_millis(100));
        // The first file now holds "first<1\n" (8 bytes); the next flush
        // would exceed the limit and must rotate.
        aol.enqueue(Op::Set { key: "second".into(), value: Value::Int(2) });
        std::thread::sleep(Duration::from_millis(100));
        drop(aol);

        let files = list_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2, "expected a rotated change log");
        assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "first<1\n");
        assert_eq!(std::fs::read_to_string(&files[1]).unwrap(), "second<2\n");
    }
}

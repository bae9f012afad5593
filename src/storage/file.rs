//! Shard record files. Both the data (MEID) and key-index artifacts share
//! the same layout: a fixed 256-byte header followed by records of the
//! form `digest(32) ‖ size(4, big-endian u32) ‖ payload(size)`. In a data
//! file the payload is the encoded value, in a key file the key bytes.

use crate::error::Result;
use crate::{encoding, errdata, errinput};

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// The fixed header size, in bytes.
pub const HEADER_SIZE: u64 = 256;
/// The current file format version.
pub const FORMAT_VERSION: u16 = 1;

/// The number of bytes preceding a record's payload.
const RECORD_OVERHEAD: u64 = 32 + 4;
/// The header prefix compared during validation. The timestamp half is
/// written but never compared, so reopening a file at a later time passes.
const MATCH_LEN: usize = 128;

/// A record file header:
///
/// - Format version as big-endian u16.
/// - 8 ASCII bytes identifying this deployment.
/// - 118 reserved zero bytes.
/// - Header write time as big-endian u64 unix seconds.
/// - 120 reserved zero bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub version: u16,
    pub signature: [u8; 8],
    pub timestamp: u64,
}

impl Header {
    /// Creates a header for the given deployment signature, stamped with
    /// the current time.
    pub fn new(signature: [u8; 8]) -> Self {
        Self { version: FORMAT_VERSION, signature, timestamp: super::unix_seconds() }
    }

    /// Encodes the header into its fixed 256-byte form.
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..10].copy_from_slice(&self.signature);
        buf[128..136].copy_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    /// Decodes a header from its fixed 256-byte form.
    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        let mut version = [0u8; 2];
        version.copy_from_slice(&buf[0..2]);
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[2..10]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[128..136]);
        Self {
            version: u16::from_be_bytes(version),
            signature,
            timestamp: u64::from_be_bytes(timestamp),
        }
    }

    /// Returns true if the headers agree on everything but the timestamp.
    pub fn matches(&self, other: &Header) -> bool {
        self.encode()[..MATCH_LEN] == other.encode()[..MATCH_LEN]
    }
}

/// An open shard record file.
pub struct RecordFile {
    /// Path to the file.
    pub path: PathBuf,
    /// The opened file.
    file: std::fs::File,
}

impl RecordFile {
    /// Opens a record file, creating it with a fresh header if it is
    /// missing or empty. An existing header that does not match the
    /// reference errors. A nonzero file shorter than one header is faint
    /// (typically an interrupted creation): it is reported as None so the
    /// caller can mark the shard inactive instead of aborting.
    pub fn open(path: PathBuf, reference: &Header, permission: u32) -> Result<Option<Self>> {
        let exists = path.exists();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !exists {
            set_permission(&path, permission)?;
        }

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&Header::new(reference.signature).encode())?;
            file.flush()?;
            return Ok(Some(Self { path, file }));
        }
        if len < HEADER_SIZE {
            log::warn!("{} is shorter than a header ({len} bytes), skipping", path.display());
            return Ok(None);
        }

        let mut buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = Header::decode(&buf);
        if !header.matches(reference) {
            return errdata!(
                "{} header mismatch: found version {} signature {:?}, expected version {} signature {:?}",
                path.display(),
                header.version,
                String::from_utf8_lossy(&header.signature),
                reference.version,
                String::from_utf8_lossy(&reference.signature),
            );
        }
        Ok(Some(Self { path, file }))
    }

    /// Scans all records in order, yielding the digest, payload, and byte
    /// position of each. A record extending past EOF stops the scan with
    /// an error; records yielded before that point remain valid. When
    /// verify_digest is set (key files), a payload that does not hash to
    /// its declared digest is an error too.
    pub fn scan(
        &mut self,
        verify_digest: bool,
        mut on_record: impl FnMut([u8; 32], Vec<u8>, u64) -> Result<()>,
    ) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let path = self.path.clone();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(HEADER_SIZE))?;

        while pos < file_len {
            let mut digest = [0u8; 32];
            let mut size = [0u8; 4];
            if pos + RECORD_OVERHEAD > file_len {
                return errdata!("{}: record at {pos} extends past end of file", path.display());
            }
            r.read_exact(&mut digest)?;
            r.read_exact(&mut size)?;
            let size = u32::from_be_bytes(size) as u64;
            if pos + RECORD_OVERHEAD + size > file_len {
                return errdata!("{}: record at {pos} extends past end of file", path.display());
            }
            let mut payload = vec![0; size as usize];
            r.read_exact(&mut payload)?;
            if verify_digest && encoding::digest(&payload) != digest {
                return errdata!("{}: record at {pos} does not match its digest", path.display());
            }
            on_record(digest, payload, pos)?;
            pos += RECORD_OVERHEAD + size;
        }
        Ok(())
    }

    /// Appends a record and returns its starting byte position.
    pub fn append(&mut self, digest: &[u8; 32], payload: &[u8]) -> Result<u64> {
        if payload.len() > u32::MAX as usize {
            return errinput!("record payload of {} bytes is too large", payload.len());
        }
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(RECORD_OVERHEAD as usize + payload.len(), &mut self.file);
        w.write_all(digest)?;
        w.write_all(&(payload.len() as u32).to_be_bytes())?;
        w.write_all(payload)?;
        w.flush()?;
        Ok(pos)
    }

    /// Flushes appended records to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        // Don't fsync in tests, to speed them up.
        #[cfg(not(test))]
        self.file.sync_all()?;
        Ok(())
    }

    /// The current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(unix)]
fn set_permission(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permission(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}

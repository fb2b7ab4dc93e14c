//! File-backed log store.
//!
//! Records are appended to a single log file; an in-memory index keyed by
//! store-LSN is rebuilt by replaying the file at open. A record re-appended
//! at an existing index supersedes the earlier one during replay, which
//! keeps crash-time re-appends idempotent.
//!
//! # File Format
//!
//! Each record in the log file:
//! ```text
//! +--------+-----------+------+--------+----------+
//! | Magic  | StoreLsn  | Len  | CRC32  | Payload  |
//! | (4)    | (8)       | (4)  | (4)    | (Len)    |
//! +--------+-----------+------+--------+----------+
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use blockrepl_common::constants::MAX_LOG_ENTRY_SIZE;
use blockrepl_common::{ReplError, ReplResult, StoreLsn};

use super::LogStore;

/// Magic number for log records.
const RECORD_MAGIC: u32 = 0x424C_4F47; // "BLOG"

/// Size of a record header (magic + store-lsn + len + crc).
const RECORD_HEADER_SIZE: usize = 4 + 8 + 4 + 4;

/// Durable log store backed by a single append-only file.
pub struct FileLogStore {
    /// Path of the log file.
    path: PathBuf,
    /// Append handle; `None` after close.
    file: Mutex<Option<File>>,
    /// Index of live records, rebuilt on open.
    index: RwLock<BTreeMap<u64, Bytes>>,
    /// Whether the store is closed.
    closed: AtomicBool,
}

impl FileLogStore {
    /// Opens the log store at `path`, creating the file if absent and
    /// replaying any existing records.
    pub fn open(path: impl AsRef<Path>) -> ReplResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut index = BTreeMap::new();
        if path.exists() {
            let mut file = File::open(&path)?;
            while let Some((lsn, payload)) = Self::read_record(&mut file)? {
                // Later records at the same index supersede earlier ones.
                index.insert(lsn, payload);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            index: RwLock::new(index),
            closed: AtomicBool::new(false),
        })
    }

    /// Closes the store, syncing pending writes.
    pub fn close(&self) -> ReplResult<()> {
        self.closed.store(true, Ordering::Release);
        let mut file = self.file.lock();
        if let Some(ref f) = *file {
            f.sync_all()?;
        }
        *file = None;
        Ok(())
    }

    /// Returns the number of live records.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> ReplResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplError::Closed);
        }
        Ok(())
    }

    fn encode_record(lsn: StoreLsn, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.put_u32_le(RECORD_MAGIC);
        buf.put_u64_le(lsn.as_u64());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(Self::checksum(lsn, payload));
        buf.put_slice(payload);
        buf.freeze()
    }

    fn checksum(lsn: StoreLsn, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.as_u64().to_le_bytes());
        hasher.update(&(payload.len() as u32).to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    fn read_record(file: &mut File) -> ReplResult<Option<(u64, Bytes)>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut cursor = &header[..];
        let magic = cursor.get_u32_le();
        if magic != RECORD_MAGIC {
            return Err(ReplError::corruption(format!(
                "invalid log record magic: {magic:#010x}"
            )));
        }
        let lsn = cursor.get_u64_le();
        let len = cursor.get_u32_le() as usize;
        let crc = cursor.get_u32_le();

        if len > MAX_LOG_ENTRY_SIZE {
            return Err(ReplError::corruption(format!(
                "log record at store-lsn {lsn} exceeds max size: {len}"
            )));
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let actual = Self::checksum(StoreLsn::new(lsn), &payload);
        if actual != crc {
            return Err(ReplError::ChecksumMismatch {
                expected: crc,
                actual,
            });
        }

        Ok(Some((lsn, Bytes::from(payload))))
    }

    /// Rewrites the log file to hold exactly the records in `index`.
    fn rewrite(&self, index: &BTreeMap<u64, Bytes>) -> ReplResult<()> {
        let tmp_path = self.path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            for (&lsn, payload) in index {
                file.write_all(&Self::encode_record(StoreLsn::new(lsn), payload))?;
            }
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn append(&self, lsn: StoreLsn, payload: Bytes) -> ReplResult<()> {
        self.check_open()?;
        if payload.len() > MAX_LOG_ENTRY_SIZE {
            return Err(ReplError::invalid_argument(format!(
                "log entry of {} bytes exceeds max {MAX_LOG_ENTRY_SIZE}",
                payload.len()
            )));
        }

        {
            let mut file = self.file.lock();
            let f = file.as_mut().ok_or(ReplError::Closed)?;
            f.write_all(&Self::encode_record(lsn, &payload))
                .map_err(|e| ReplError::log_store(format!("append at {lsn} failed: {e}")))?;
        }

        self.index.write().insert(lsn.as_u64(), payload);
        Ok(())
    }

    fn scan(
        &self,
        from: StoreLsn,
        visitor: &mut dyn FnMut(StoreLsn, &[u8]) -> bool,
    ) -> ReplResult<()> {
        let index = self.index.read();
        for (&lsn, payload) in index.range(from.as_u64()..) {
            if !visitor(StoreLsn::new(lsn), payload) {
                break;
            }
        }
        Ok(())
    }

    fn truncate_upto(&self, upto: StoreLsn) -> ReplResult<()> {
        self.check_open()?;
        let mut index = self.index.write();
        *index = index.split_off(&(upto.as_u64() + 1));
        self.rewrite(&index)
    }

    fn sync_upto(&self, upto: Option<StoreLsn>) -> ReplResult<()> {
        if upto.is_none() {
            return Ok(());
        }
        let file = self.file.lock();
        if let Some(ref f) = *file {
            f.sync_all()
                .map_err(|e| ReplError::log_store(format!("sync failed: {e}")))?;
        }
        Ok(())
    }

    fn last_lsn(&self) -> Option<StoreLsn> {
        self.index
            .read()
            .keys()
            .next_back()
            .map(|&lsn| StoreLsn::new(lsn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_scan() {
        let tmp = TempDir::new().unwrap();
        let store = FileLogStore::open(tmp.path().join("test.log")).unwrap();

        for i in 0..5u64 {
            store
                .append(StoreLsn::new(i), Bytes::from(format!("rec{i}")))
                .unwrap();
        }

        let mut seen = Vec::new();
        store
            .scan(StoreLsn::new(2), &mut |lsn, payload| {
                seen.push((lsn.as_u64(), payload.to_vec()));
                true
            })
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (2, b"rec2".to_vec()));
        assert_eq!(seen[2], (4, b"rec4".to_vec()));
    }

    #[test]
    fn test_scan_stops_on_false() {
        let tmp = TempDir::new().unwrap();
        let store = FileLogStore::open(tmp.path().join("test.log")).unwrap();

        for i in 0..5u64 {
            store.append(StoreLsn::new(i), Bytes::from("x")).unwrap();
        }

        let mut count = 0;
        store
            .scan(StoreLsn::new(0), &mut |_, _| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_reopen_replays() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.log");

        {
            let store = FileLogStore::open(&path).unwrap();
            store.append(StoreLsn::new(0), Bytes::from("a")).unwrap();
            store.append(StoreLsn::new(1), Bytes::from("b")).unwrap();
            store.sync_upto(Some(StoreLsn::new(1))).unwrap();
            store.close().unwrap();
        }

        let store = FileLogStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.last_lsn(), Some(StoreLsn::new(1)));
    }

    #[test]
    fn test_reappend_overwrites() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.log");

        {
            let store = FileLogStore::open(&path).unwrap();
            store.append(StoreLsn::new(3), Bytes::from("old")).unwrap();
            store.append(StoreLsn::new(3), Bytes::from("new")).unwrap();
            store.close().unwrap();
        }

        let store = FileLogStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        let mut seen = Vec::new();
        store
            .scan(StoreLsn::FIRST, &mut |_, payload| {
                seen.push(payload.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"new".to_vec()]);
    }

    #[test]
    fn test_truncate() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.log");
        let store = FileLogStore::open(&path).unwrap();

        for i in 0..10u64 {
            store.append(StoreLsn::new(i), Bytes::from("x")).unwrap();
        }

        store.truncate_upto(StoreLsn::new(6)).unwrap();
        assert_eq!(store.len(), 3);

        // Truncation is durable across reopen.
        store.close().unwrap();
        let store = FileLogStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        let mut first = None;
        store
            .scan(StoreLsn::FIRST, &mut |lsn, _| {
                first.get_or_insert(lsn.as_u64());
                false
            })
            .unwrap();
        assert_eq!(first, Some(7));
    }

    #[test]
    fn test_sync_none_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = FileLogStore::open(tmp.path().join("test.log")).unwrap();
        store.sync_upto(None).unwrap();
    }

    #[test]
    fn test_closed_rejects_append() {
        let tmp = TempDir::new().unwrap();
        let store = FileLogStore::open(tmp.path().join("test.log")).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.append(StoreLsn::new(0), Bytes::from("x")),
            Err(ReplError::Closed)
        ));
    }
}

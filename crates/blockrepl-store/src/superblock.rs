//! Replica-set superblock.
//!
//! The superblock is the durable root record of one replica set: its uuid,
//! the LSN up to which it has committed, the LSN up to which it has
//! checkpointed, and the ids of its log stores. It is rewritten atomically
//! (tmp file + rename) and protected by a trailing CRC32.
//!
//! # On-Disk Format (fixed 64 bytes)
//!
//! ```text
//! offset  0: u32 LE  magic
//! offset  4: u32 LE  version
//! offset  8: [u8;16] uuid
//! offset 24: i64 LE  commit_lsn
//! offset 32: i64 LE  checkpoint_lsn
//! offset 40: u32 LE  free_pba_store_id
//! offset 44: u32 LE  data_journal_id
//! offset 48: [u8;12] reserved
//! offset 60: u32 LE  crc32 of bytes [0, 60)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use blockrepl_common::{GroupId, LogStoreId, Lsn, ReplError, ReplResult};

/// Magic number identifying a replica-set superblock.
const SUPERBLOCK_MAGIC: u32 = 0x4252_5342; // "BRSB"

/// Superblock format version.
const SUPERBLOCK_VERSION: u32 = 1;

/// Encoded size in bytes.
const SUPERBLOCK_SIZE: usize = 64;

/// Record tag; superblock files are named `<tag>_<uuid>.sb`.
const SUPERBLOCK_TAG: &str = "replica_set";

/// Durable root record of one replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSuperblock {
    /// Uuid of the replica set.
    pub uuid: GroupId,
    /// LSN up to which this replica has committed.
    pub commit_lsn: Lsn,
    /// LSN up to which this replica has checkpointed.
    pub checkpoint_lsn: Lsn,
    /// Log store holding the free-PBA records.
    pub free_pba_store_id: LogStoreId,
    /// Log store holding the data journal.
    pub data_journal_id: LogStoreId,
}

impl ReplicaSuperblock {
    /// Creates a fresh superblock for a new replica set.
    #[must_use]
    pub fn new(uuid: GroupId, free_pba_store_id: LogStoreId, data_journal_id: LogStoreId) -> Self {
        Self {
            uuid,
            commit_lsn: Lsn::INVALID,
            checkpoint_lsn: Lsn::INVALID,
            free_pba_store_id,
            data_journal_id,
        }
    }

    /// Encodes the superblock into its on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE);
        buf.put_u32_le(SUPERBLOCK_MAGIC);
        buf.put_u32_le(SUPERBLOCK_VERSION);
        buf.put_slice(&self.uuid.into_bytes());
        buf.put_i64_le(self.commit_lsn.as_u64() as i64);
        buf.put_i64_le(self.checkpoint_lsn.as_u64() as i64);
        buf.put_u32_le(self.free_pba_store_id.as_u32());
        buf.put_u32_le(self.data_journal_id.as_u32());
        buf.put_bytes(0, 12);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        let mut out = [0u8; SUPERBLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a superblock, verifying magic, version, and checksum.
    pub fn decode(raw: &[u8]) -> ReplResult<Self> {
        if raw.len() < SUPERBLOCK_SIZE {
            return Err(ReplError::corruption(format!(
                "superblock too short: {} bytes",
                raw.len()
            )));
        }

        let actual = crc32fast::hash(&raw[..SUPERBLOCK_SIZE - 4]);
        let mut trailer = &raw[SUPERBLOCK_SIZE - 4..SUPERBLOCK_SIZE];
        let expected = trailer.get_u32_le();
        if actual != expected {
            return Err(ReplError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = &raw[..];
        let magic = cursor.get_u32_le();
        if magic != SUPERBLOCK_MAGIC {
            return Err(ReplError::corruption(format!(
                "invalid superblock magic: {magic:#010x}"
            )));
        }
        let version = cursor.get_u32_le();
        if version != SUPERBLOCK_VERSION {
            return Err(ReplError::corruption(format!(
                "unsupported superblock version: {version}"
            )));
        }

        let mut uuid = [0u8; 16];
        cursor.copy_to_slice(&mut uuid);
        let commit_lsn = cursor.get_i64_le();
        let checkpoint_lsn = cursor.get_i64_le();
        if commit_lsn < 0 || checkpoint_lsn < 0 {
            return Err(ReplError::corruption("negative lsn in superblock"));
        }
        let free_pba_store_id = LogStoreId::new(cursor.get_u32_le());
        let data_journal_id = LogStoreId::new(cursor.get_u32_le());

        Ok(Self {
            uuid: GroupId::from_bytes(uuid),
            commit_lsn: Lsn::new(commit_lsn as u64),
            checkpoint_lsn: Lsn::new(checkpoint_lsn as u64),
            free_pba_store_id,
            data_journal_id,
        })
    }
}

/// Persists superblocks under one directory, one file per replica set.
#[derive(Debug)]
pub struct SuperblockStore {
    dir: PathBuf,
}

impl SuperblockStore {
    /// Opens a store over `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> ReplResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persists a superblock atomically.
    pub fn persist(&self, sb: &ReplicaSuperblock) -> ReplResult<()> {
        let path = self.path_for(sb.uuid);
        let tmp = path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&sb.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Loads the superblock of the given replica set.
    pub fn load(&self, uuid: GroupId) -> ReplResult<ReplicaSuperblock> {
        let path = self.path_for(uuid);
        let mut raw = Vec::new();
        File::open(&path)?.read_to_end(&mut raw)?;
        ReplicaSuperblock::decode(&raw)
    }

    /// Removes the superblock of the given replica set.
    pub fn remove(&self, uuid: GroupId) -> ReplResult<()> {
        let path = self.path_for(uuid);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Returns all superblocks found in the directory.
    ///
    /// Used at service startup to re-open surviving replica sets.
    pub fn scan(&self) -> ReplResult<Vec<ReplicaSuperblock>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_superblock = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SUPERBLOCK_TAG) && n.ends_with(".sb"));
            if !is_superblock {
                continue;
            }

            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            found.push(ReplicaSuperblock::decode(&raw)?);
        }
        Ok(found)
    }

    fn path_for(&self, uuid: GroupId) -> PathBuf {
        self.dir.join(format!("{SUPERBLOCK_TAG}_{uuid}.sb"))
    }
}

//! File-backed storage engine: the `file` backend.
//!
//! Blocks live in a single data file at `pba * block_size` offsets.
//! Allocation prefers a contiguous run above the high-water mark and falls
//! back to recycled blocks from the free set. Allocator state is persisted
//! in a sidecar meta file on flush and close; blocks allocated after the
//! last flush and never referenced by a log entry are reclaimed the next
//! time the free set is rebuilt from free-PBA journal replay.
//!
//! # Meta File Format
//!
//! ```text
//! +--------+---------+------------+----------+------------+-----------+----------------+
//! | Magic  | Version | BlockSize  | Capacity | HighWater  | FreeCount | Free (8 each)  |
//! | (4)    | (4)     | (8)        | (8)      | (8)        | (4)       |                |
//! +--------+---------+------------+----------+------------+-----------+----------------+
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use blockrepl_common::{Pba, PbaList, ReplError, ReplResult};

use super::{blocks_for, BoxFuture, SgList, StorageEngine};

/// Magic number for the engine meta file.
const META_MAGIC: u32 = 0x4252_454E; // "BREN"

/// Meta file format version.
const META_VERSION: u32 = 1;

/// Name of the data file inside the engine directory.
const DATA_FILE: &str = "blocks.dat";

/// Name of the allocator meta file inside the engine directory.
const META_FILE: &str = "engine.meta";

#[derive(Debug)]
struct Allocator {
    /// Blocks below this mark have been handed out at least once.
    high_water: u64,
    /// Recycled blocks available for reallocation.
    free: BTreeSet<u64>,
}

impl Allocator {
    fn available(&self, capacity: u64) -> u64 {
        capacity - self.high_water + self.free.len() as u64
    }
}

/// Storage engine backed by a single data file.
pub struct FileStorageEngine {
    dir: PathBuf,
    block_size: usize,
    capacity_blocks: u64,
    sync_writes: bool,
    data: Arc<File>,
    alloc: Mutex<Allocator>,
}

impl FileStorageEngine {
    /// Opens the engine rooted at `dir`, creating data and meta files as
    /// needed.
    pub fn open(
        dir: impl AsRef<Path>,
        block_size: usize,
        capacity_blocks: u64,
        sync_writes: bool,
    ) -> ReplResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(DATA_FILE))?;

        let alloc = match Self::load_meta(&dir.join(META_FILE), block_size, capacity_blocks)? {
            Some(alloc) => alloc,
            None => Allocator {
                high_water: 0,
                free: BTreeSet::new(),
            },
        };

        Ok(Arc::new(Self {
            dir,
            block_size,
            capacity_blocks,
            sync_writes,
            data: Arc::new(data),
            alloc: Mutex::new(alloc),
        }))
    }

    /// Number of blocks still available for allocation.
    pub fn available_blocks(&self) -> u64 {
        self.alloc.lock().available(self.capacity_blocks)
    }

    fn load_meta(
        path: &Path,
        block_size: usize,
        capacity_blocks: u64,
    ) -> ReplResult<Option<Allocator>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        if raw.len() < 36 {
            return Err(ReplError::corruption("engine meta file too short"));
        }

        let mut cursor = &raw[..];
        let magic = cursor.get_u32_le();
        if magic != META_MAGIC {
            return Err(ReplError::corruption(format!(
                "invalid engine meta magic: {magic:#010x}"
            )));
        }
        let version = cursor.get_u32_le();
        if version != META_VERSION {
            return Err(ReplError::corruption(format!(
                "unsupported engine meta version: {version}"
            )));
        }
        let meta_block_size = cursor.get_u64_le();
        let meta_capacity = cursor.get_u64_le();
        if meta_block_size != block_size as u64 || meta_capacity != capacity_blocks {
            return Err(ReplError::invalid_argument(format!(
                "engine geometry mismatch: on-disk {meta_block_size}x{meta_capacity}, \
                 configured {block_size}x{capacity_blocks}"
            )));
        }

        let high_water = cursor.get_u64_le();
        let free_count = cursor.get_u32_le() as usize;
        if cursor.remaining() < free_count * 8 {
            return Err(ReplError::corruption("engine meta free set truncated"));
        }
        let mut free = BTreeSet::new();
        for _ in 0..free_count {
            free.insert(cursor.get_u64_le());
        }

        Ok(Some(Allocator { high_water, free }))
    }

    fn persist_meta(&self, alloc: &Allocator) -> ReplResult<()> {
        let path = self.dir.join(META_FILE);
        let tmp = path.with_extension("tmp");

        let mut buf = BytesMut::with_capacity(36 + alloc.free.len() * 8);
        buf.put_u32_le(META_MAGIC);
        buf.put_u32_le(META_VERSION);
        buf.put_u64_le(self.block_size as u64);
        buf.put_u64_le(self.capacity_blocks);
        buf.put_u64_le(alloc.high_water);
        buf.put_u32_le(alloc.free.len() as u32);
        for &pba in &alloc.free {
            buf.put_u64_le(pba);
        }

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn is_allocated(alloc: &Allocator, pba: u64) -> bool {
        pba < alloc.high_water && !alloc.free.contains(&pba)
    }
}

impl StorageEngine for FileStorageEngine {
    fn alloc_pbas(&self, size: usize) -> ReplResult<PbaList> {
        let needed = blocks_for(size, self.block_size);
        let mut alloc = self.alloc.lock();
        if alloc.available(self.capacity_blocks) < needed {
            return Err(ReplError::OutOfSpace { requested: size });
        }

        let mut pbas = PbaList::with_capacity(needed as usize);

        // Prefer one contiguous run above the high-water mark.
        if self.capacity_blocks - alloc.high_water >= needed {
            for _ in 0..needed {
                pbas.push(Pba::new(alloc.high_water));
                alloc.high_water += 1;
            }
            return Ok(pbas);
        }

        // Fragmented path: recycled blocks one at a time.
        for _ in 0..needed {
            let pba = if let Some(&first) = alloc.free.iter().next() {
                alloc.free.remove(&first);
                first
            } else {
                let pba = alloc.high_water;
                alloc.high_water += 1;
                pba
            };
            pbas.push(Pba::new(pba));
        }
        Ok(pbas)
    }

    fn write(&self, pbas: &[Pba], value: &SgList) -> BoxFuture<'static, ReplResult<()>> {
        let pbas = pbas.to_vec();
        let payload = value.to_bytes();
        let block_size = self.block_size;
        let sync_writes = self.sync_writes;
        let data = Arc::clone(&self.data);

        Box::pin(async move {
            if blocks_for(payload.len(), block_size) as usize > pbas.len() {
                return Err(ReplError::invalid_argument(format!(
                    "{} pbas cannot hold {} bytes",
                    pbas.len(),
                    payload.len()
                )));
            }

            tokio::task::spawn_blocking(move || -> ReplResult<()> {
                for (i, pba) in pbas.iter().enumerate() {
                    let start = i * block_size;
                    if start >= payload.len() {
                        break;
                    }
                    let end = payload.len().min(start + block_size);
                    data.write_all_at(&payload[start..end], pba.as_u64() * block_size as u64)?;
                }
                if sync_writes {
                    data.sync_data()?;
                }
                Ok(())
            })
            .await
            .map_err(|e| ReplError::internal(format!("write task failed: {e}")))?
        })
    }

    fn read(&self, pba: Pba, len: usize) -> BoxFuture<'static, ReplResult<Bytes>> {
        let block_size = self.block_size;
        let data = Arc::clone(&self.data);

        Box::pin(async move {
            if len > block_size {
                return Err(ReplError::invalid_argument(format!(
                    "read of {len} bytes exceeds block size {block_size}"
                )));
            }

            tokio::task::spawn_blocking(move || -> ReplResult<Bytes> {
                let mut buf = vec![0u8; len];
                data.read_exact_at(&mut buf, pba.as_u64() * block_size as u64)?;
                Ok(Bytes::from(buf))
            })
            .await
            .map_err(|e| ReplError::internal(format!("read task failed: {e}")))?
        })
    }

    fn free_pba(&self, pba: Pba) -> ReplResult<()> {
        let mut alloc = self.alloc.lock();
        if Self::is_allocated(&alloc, pba.as_u64()) {
            alloc.free.insert(pba.as_u64());
        }
        Ok(())
    }

    fn flush(&self) -> ReplResult<()> {
        self.data.sync_all()?;
        let alloc = self.alloc.lock();
        self.persist_meta(&alloc)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

impl std::fmt::Debug for FileStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorageEngine")
            .field("dir", &self.dir)
            .field("block_size", &self.block_size)
            .field("capacity_blocks", &self.capacity_blocks)
            .finish()
    }
}

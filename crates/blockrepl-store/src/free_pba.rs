//! Free-PBA records and their journal.
//!
//! When a commit releases PBAs, they are recorded durably here — keyed by
//! the commit's LSN — before the storage engine is ever told to free them.
//! Replay after restart re-issues the frees; the engine's `free_pba` is
//! idempotent, so records naming already-freed PBAs are harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use blockrepl_common::constants::MAX_PBAS_PER_RECORD;
use blockrepl_common::{Lsn, Pba, PbaList, ReplError, ReplResult};

use crate::log_store::LogStore;

/// PBAs released by the commit at one LSN.
///
/// # Record Format (unaligned, little-endian)
///
/// ```text
/// offset 0:         u32  N          // number of PBAs
/// offset 4:         u64  pba[0]
/// ...
/// offset 4+8*(N-1): u64  pba[N-1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreePbaRecord {
    /// The commit LSN this record belongs to.
    pub lsn: Lsn,
    /// The released PBAs.
    pub pbas: PbaList,
}

impl FreePbaRecord {
    /// Creates a new record.
    #[must_use]
    pub fn new(lsn: Lsn, pbas: PbaList) -> Self {
        Self { lsn, pbas }
    }

    /// Encodes the record payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.pbas.len() * 8);
        buf.put_u32_le(self.pbas.len() as u32);
        for pba in &self.pbas {
            buf.put_u64_le(pba.as_u64());
        }
        buf.freeze()
    }

    /// Decodes a record payload journaled at `lsn`.
    pub fn decode(lsn: Lsn, raw: &[u8]) -> ReplResult<Self> {
        if raw.len() < 4 {
            return Err(ReplError::corruption(format!(
                "free-pba record at lsn {lsn} too short: {} bytes",
                raw.len()
            )));
        }

        let mut cursor = raw;
        let count = cursor.get_u32_le() as usize;
        if count > MAX_PBAS_PER_RECORD {
            return Err(ReplError::corruption(format!(
                "free-pba record at lsn {lsn} claims {count} pbas"
            )));
        }
        if cursor.remaining() != count * 8 {
            return Err(ReplError::corruption(format!(
                "free-pba record at lsn {lsn}: expected {} payload bytes, got {}",
                count * 8,
                cursor.remaining()
            )));
        }

        let mut pbas = PbaList::with_capacity(count);
        for _ in 0..count {
            pbas.push(Pba::new(cursor.get_u64_le()));
        }
        Ok(Self { lsn, pbas })
    }
}

/// Durable per-replica-set journal of `(lsn -> [pba])` pending frees.
///
/// Owns exactly one log store, addressed at store-LSN = `lsn - 1`.
pub struct FreePbaJournal {
    store: Arc<dyn LogStore>,
    /// LSN of the most recent append; zero when nothing is pending flush.
    last_write_lsn: AtomicU64,
}

impl FreePbaJournal {
    /// Creates a journal over its log store.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            last_write_lsn: AtomicU64::new(0),
        }
    }

    /// Appends the record of PBAs released at `lsn`.
    ///
    /// Non-blocking; durability is established by [`FreePbaJournal::sync`].
    /// A failure here must fail the commit: the caller must not advance its
    /// commit LSN.
    pub fn append(&self, lsn: Lsn, pbas: &[Pba]) -> ReplResult<()> {
        if !lsn.is_valid() {
            return Err(ReplError::InvalidLsn { lsn });
        }
        if pbas.len() > MAX_PBAS_PER_RECORD {
            return Err(ReplError::invalid_argument(format!(
                "{} pbas exceed the per-record limit",
                pbas.len()
            )));
        }

        let record = FreePbaRecord::new(lsn, pbas.to_vec());
        self.last_write_lsn.store(lsn.as_u64(), Ordering::Release);
        self.store.append(lsn.to_store(), record.encode())
    }

    /// Replays records with `start_lsn <= lsn < end_lsn`, in LSN order.
    ///
    /// Iteration continues while `lsn < end_lsn - 1`; the record at
    /// `end_lsn - 1` is still emitted but stops the walk, so callers drain
    /// exactly up to their frontier.
    pub fn replay(
        &self,
        start_lsn: Lsn,
        end_lsn: Lsn,
        visitor: &mut dyn FnMut(Lsn, PbaList),
    ) -> ReplResult<()> {
        if !start_lsn.is_valid() {
            return Err(ReplError::InvalidLsn { lsn: start_lsn });
        }

        let mut decode_err = None;
        self.store.scan(start_lsn.to_store(), &mut |slsn, raw| {
            let rlsn = slsn.to_repl();
            let keep_going = rlsn.as_u64() < end_lsn.as_u64().saturating_sub(1);
            if rlsn < end_lsn {
                match FreePbaRecord::decode(rlsn, raw) {
                    Ok(record) => visitor(rlsn, record.pbas),
                    Err(e) => {
                        decode_err = Some(e);
                        return false;
                    }
                }
            }
            keep_going
        })?;

        match decode_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Physically removes all records with `lsn <= upto`.
    pub fn truncate_upto(&self, upto: Lsn) -> ReplResult<()> {
        if !upto.is_valid() {
            return Err(ReplError::InvalidLsn { lsn: upto });
        }
        self.store.truncate_upto(upto.to_store())?;
        self.last_write_lsn.store(0, Ordering::Release);
        Ok(())
    }

    /// Forces durability up to the last appended record.
    pub fn sync(&self) -> ReplResult<()> {
        let last = self.last_write_lsn.load(Ordering::Acquire);
        let upto = if last == 0 {
            None
        } else {
            Some(Lsn::new(last).to_store())
        };
        self.store.sync_upto(upto)
    }

    /// LSN of the most recent append, if one is pending flush.
    pub fn last_write_lsn(&self) -> Option<Lsn> {
        match self.last_write_lsn.load(Ordering::Acquire) {
            0 => None,
            lsn => Some(Lsn::new(lsn)),
        }
    }
}

impl std::fmt::Debug for FreePbaJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreePbaJournal")
            .field("last_write_lsn", &self.last_write_lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::MemoryLogStore;

    fn pbas(raw: &[u64]) -> PbaList {
        raw.iter().copied().map(Pba::new).collect()
    }

    fn journal_with(records: &[(u64, &[u64])]) -> FreePbaJournal {
        let journal = FreePbaJournal::new(Arc::new(MemoryLogStore::new()));
        for &(lsn, plist) in records {
            journal.append(Lsn::new(lsn), &pbas(plist)).unwrap();
        }
        journal
    }

    #[test]
    fn test_record_roundtrip() {
        for n in [0usize, 1, 2, 1000] {
            let record = FreePbaRecord::new(
                Lsn::new(9),
                (0..n as u64).map(|i| Pba::new(i * 3 + 7)).collect(),
            );
            let decoded = FreePbaRecord::decode(Lsn::new(9), &record.encode()).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(FreePbaRecord::decode(Lsn::new(1), &[1, 2]).is_err());

        // Count claims more pbas than the payload carries.
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_u64_le(1);
        assert!(FreePbaRecord::decode(Lsn::new(1), &buf).is_err());
    }

    #[test]
    fn test_append_tracks_last_write() {
        let journal = journal_with(&[]);
        assert_eq!(journal.last_write_lsn(), None);
        journal.sync().unwrap(); // no-op on the invalid sentinel

        journal.append(Lsn::new(3), &pbas(&[70])).unwrap();
        assert_eq!(journal.last_write_lsn(), Some(Lsn::new(3)));
        journal.sync().unwrap();
    }

    #[test]
    fn test_replay_boundary() {
        // Records at lsns {1,2,3,4,5}; replay [2, 5) must visit {2,3,4}.
        let journal = journal_with(&[
            (1, &[10]),
            (2, &[20]),
            (3, &[30]),
            (4, &[40]),
            (5, &[50]),
        ]);

        let mut seen = Vec::new();
        journal
            .replay(Lsn::new(2), Lsn::new(5), &mut |lsn, plist| {
                seen.push((lsn.as_u64(), plist));
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (2, pbas(&[20])),
                (3, pbas(&[30])),
                (4, pbas(&[40])),
            ]
        );
    }

    #[test]
    fn test_replay_skips_gaps() {
        let journal = journal_with(&[(2, &[20]), (5, &[50]), (9, &[90])]);

        let mut seen = Vec::new();
        journal
            .replay(Lsn::FIRST, Lsn::new(10), &mut |lsn, _| {
                seen.push(lsn.as_u64());
            })
            .unwrap();
        assert_eq!(seen, vec![2, 5, 9]);
    }

    #[test]
    fn test_truncate_resets_last_write() {
        let journal = journal_with(&[(1, &[10]), (2, &[20]), (3, &[30])]);

        journal.truncate_upto(Lsn::new(2)).unwrap();
        assert_eq!(journal.last_write_lsn(), None);

        let mut seen = Vec::new();
        journal
            .replay(Lsn::FIRST, Lsn::new(100), &mut |lsn, _| {
                seen.push(lsn.as_u64());
            })
            .unwrap();
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn test_reappend_same_lsn_overwrites() {
        let journal = journal_with(&[(4, &[40, 41])]);
        journal.append(Lsn::new(4), &pbas(&[40, 41])).unwrap();

        let mut seen = Vec::new();
        journal
            .replay(Lsn::FIRST, Lsn::new(100), &mut |lsn, plist| {
                seen.push((lsn.as_u64(), plist));
            })
            .unwrap();
        assert_eq!(seen, vec![(4, pbas(&[40, 41]))]);
    }
}

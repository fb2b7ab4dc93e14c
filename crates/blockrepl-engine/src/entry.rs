//! Header-channel log entries.
//!
//! A log entry carries the small, consensus-replicated side of a write:
//! the opaque header and key plus the PBAs where the originating replica
//! placed the payload. The payload itself travels out-of-band over the
//! data channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use blockrepl_common::constants::MAX_LOG_ENTRY_SIZE;
use blockrepl_common::{Pba, PbaList, ReplError, ReplResult, ReplicaId};

/// Magic number for encoded log entries.
const ENTRY_MAGIC: u32 = 0x4252_4C45; // "BRLE"

/// Fixed part of an encoded entry: magic + origin len + header len +
/// key len + pba count.
const ENTRY_FIXED_SIZE: usize = 4 + 2 + 4 + 4 + 4;

/// One entry of the header channel.
///
/// `header` and `key` are opaque to the engine and conveyed as-is. The
/// `origin` names the replica whose storage engine allocated `pbas`, so a
/// follower can form fully-qualified PBAs from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Replica that allocated the PBAs.
    pub origin: ReplicaId,
    /// Opaque application header.
    pub header: Bytes,
    /// Opaque application key.
    pub key: Bytes,
    /// PBAs covering the payload on the origin replica.
    pub pbas: PbaList,
}

impl LogEntry {
    /// Creates a new log entry.
    pub fn new(
        origin: impl Into<ReplicaId>,
        header: Bytes,
        key: Bytes,
        pbas: PbaList,
    ) -> Self {
        Self {
            origin: origin.into(),
            header,
            key,
            pbas,
        }
    }

    /// Encodes the entry for the data journal.
    ///
    /// ```text
    /// +-------+-----------+------------+---------+-----------+--------+------+-----+----------------+-------+
    /// | Magic | OriginLen | HeaderLen  | KeyLen  | PbaCount  | Origin | Hdr  | Key | Pbas (8 each)  | CRC32 |
    /// | (4)   | (2)       | (4)        | (4)     | (4)       |        |      |     |                | (4)   |
    /// +-------+-----------+------------+---------+-----------+--------+------+-----+----------------+-------+
    /// ```
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let origin = self.origin.as_str().as_bytes();
        let size = ENTRY_FIXED_SIZE
            + origin.len()
            + self.header.len()
            + self.key.len()
            + self.pbas.len() * 8
            + 4;

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32_le(ENTRY_MAGIC);
        buf.put_u16_le(origin.len() as u16);
        buf.put_u32_le(self.header.len() as u32);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_u32_le(self.pbas.len() as u32);
        buf.put_slice(origin);
        buf.put_slice(&self.header);
        buf.put_slice(&self.key);
        for pba in &self.pbas {
            buf.put_u64_le(pba.as_u64());
        }

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes an entry, verifying magic and checksum.
    pub fn decode(raw: &[u8]) -> ReplResult<Self> {
        if raw.len() < ENTRY_FIXED_SIZE + 4 {
            return Err(ReplError::corruption(format!(
                "log entry too short: {} bytes",
                raw.len()
            )));
        }
        if raw.len() > MAX_LOG_ENTRY_SIZE {
            return Err(ReplError::corruption(format!(
                "log entry of {} bytes exceeds max size",
                raw.len()
            )));
        }

        let body = &raw[..raw.len() - 4];
        let mut trailer = &raw[raw.len() - 4..];
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(ReplError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let magic = cursor.get_u32_le();
        if magic != ENTRY_MAGIC {
            return Err(ReplError::corruption(format!(
                "invalid log entry magic: {magic:#010x}"
            )));
        }

        let origin_len = cursor.get_u16_le() as usize;
        let header_len = cursor.get_u32_le() as usize;
        let key_len = cursor.get_u32_le() as usize;
        let pba_count = cursor.get_u32_le() as usize;

        if cursor.remaining() != origin_len + header_len + key_len + pba_count * 8 {
            return Err(ReplError::corruption("log entry length mismatch"));
        }

        let origin = std::str::from_utf8(&cursor[..origin_len])
            .map_err(|_| ReplError::corruption("log entry origin is not utf-8"))?
            .to_string();
        cursor.advance(origin_len);

        let header = Bytes::copy_from_slice(&cursor[..header_len]);
        cursor.advance(header_len);
        let key = Bytes::copy_from_slice(&cursor[..key_len]);
        cursor.advance(key_len);

        let mut pbas = PbaList::with_capacity(pba_count);
        for _ in 0..pba_count {
            pbas.push(Pba::new(cursor.get_u64_le()));
        }

        Ok(Self {
            origin: ReplicaId::new(origin),
            header,
            key,
            pbas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let entry = LogEntry::new(
            "srv-a",
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"k"),
            vec![Pba::new(100), Pba::new(101)],
        );
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_empty_fields_roundtrip() {
        let entry = LogEntry::new("r", Bytes::new(), Bytes::new(), vec![]);
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_corruption_detected() {
        let entry = LogEntry::new(
            "srv-a",
            Bytes::from_static(b"hdr"),
            Bytes::from_static(b"key"),
            vec![Pba::new(7)],
        );
        let mut raw = entry.encode().to_vec();
        raw[10] ^= 0x01;
        assert!(LogEntry::decode(&raw).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(LogEntry::decode(&[0u8; 4]).is_err());
    }
}

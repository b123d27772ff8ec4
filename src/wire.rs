//! Wire encoding of snapshot and delta records.
//!
//! Both headers use fixed little-endian layouts so that readers across
//! versions agree on the bytes. Snapshot payloads are optionally
//! Zstd-compressed; delta headers are optional on the wire and recovered
//! defensively on read (legacy writers emitted raw user bytes).

use crate::error::{Result, RsmError};
use crate::types::Lsn;
use uuid::Uuid;

/// Zstd level used for snapshot payloads.
const ZSTD_LEVEL: i32 = 5;

/// Header prefixed to every snapshot payload.
///
/// Layout (little-endian): `format_version:u8`, `flags:u8`, `byte_offset:u64`,
/// `offset:u64`, `base_version:u64`, then for `FORMAT_WITH_READ_PTR` and up:
/// `length:u32`, `delta_log_read_ptr:u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: u8,
    pub flags: u8,
    /// Total bytes of delta records the snapshot accounts for.
    pub byte_offset: u64,
    /// Count of delta records the snapshot accounts for.
    pub offset: u64,
    /// LSN of the latest delta included in the snapshot.
    pub base_version: Lsn,
    /// LSN up to which the snapshot considered the delta log. Always
    /// `>= base_version`; `Lsn::INVALID` for `FORMAT_BASE` snapshots.
    pub delta_log_read_ptr: Lsn,
}

impl SnapshotHeader {
    /// Original format: no read pointer.
    pub const FORMAT_BASE: u8 = 0;
    /// Adds `length` and `delta_log_read_ptr` fields.
    pub const FORMAT_WITH_READ_PTR: u8 = 1;

    /// The payload following the header is Zstd-compressed.
    pub const FLAG_ZSTD: u8 = 1;

    const BASE_LEN: usize = 1 + 1 + 8 + 8 + 8;
    const READ_PTR_LEN: usize = Self::BASE_LEN + 4 + 8;

    /// Encoded length for a given format version.
    pub fn encoded_len(format_version: u8) -> usize {
        if format_version >= Self::FORMAT_WITH_READ_PTR {
            Self::READ_PTR_LEN
        } else {
            Self::BASE_LEN
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::FLAG_ZSTD != 0
    }

    fn serialize(&self) -> Vec<u8> {
        let len = Self::encoded_len(self.format_version);
        let mut buf = Vec::with_capacity(len);
        buf.push(self.format_version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.byte_offset.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.base_version.0.to_le_bytes());
        if self.format_version >= Self::FORMAT_WITH_READ_PTR {
            buf.extend_from_slice(&(len as u32).to_le_bytes());
            buf.extend_from_slice(&self.delta_log_read_ptr.0.to_le_bytes());
        }
        buf
    }

    /// Parse a header from the front of `payload`. Returns the header and the
    /// number of bytes it occupies.
    pub fn deserialize(payload: &[u8]) -> Result<(Self, usize)> {
        if payload.len() < Self::BASE_LEN {
            return Err(RsmError::TruncatedSnapshotHeader(payload.len()));
        }

        let format_version = payload[0];
        let flags = payload[1];
        let byte_offset = read_u64(payload, 2);
        let offset = read_u64(payload, 10);
        let base_version = Lsn(read_u64(payload, 18));

        if format_version < Self::FORMAT_WITH_READ_PTR {
            let header = SnapshotHeader {
                format_version,
                flags,
                byte_offset,
                offset,
                base_version,
                delta_log_read_ptr: Lsn::INVALID,
            };
            return Ok((header, Self::BASE_LEN));
        }

        if payload.len() < Self::READ_PTR_LEN {
            return Err(RsmError::TruncatedSnapshotHeader(payload.len()));
        }

        // `length` lets newer writers extend the header; skip what we don't
        // understand.
        let length = read_u32(payload, 26) as usize;
        if length < Self::READ_PTR_LEN || length > payload.len() {
            return Err(RsmError::UnsupportedFormatVersion(format_version));
        }
        let delta_log_read_ptr = Lsn(read_u64(payload, 30));

        let header = SnapshotHeader {
            format_version,
            flags,
            byte_offset,
            offset,
            base_version,
            delta_log_read_ptr,
        };
        Ok((header, length))
    }
}

/// Serialize a snapshot: header followed by the (optionally compressed)
/// state payload. The Zstd flag is set in the emitted header when
/// `compress` is true.
pub fn encode_snapshot(mut header: SnapshotHeader, state: &[u8], compress: bool) -> Result<Vec<u8>> {
    let body = if compress {
        header.flags |= SnapshotHeader::FLAG_ZSTD;
        zstd::encode_all(state, ZSTD_LEVEL).map_err(|e| RsmError::Compress(e.to_string()))?
    } else {
        header.flags &= !SnapshotHeader::FLAG_ZSTD;
        state.to_vec()
    };

    let mut buf = header.serialize();
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parse a snapshot into its header and decompressed state payload.
pub fn decode_snapshot(payload: &[u8]) -> Result<(SnapshotHeader, Vec<u8>)> {
    let (header, header_len) = SnapshotHeader::deserialize(payload)?;
    let body = &payload[header_len..];

    let state = if header.is_compressed() {
        zstd::decode_all(body).map_err(|e| RsmError::Decompress(e.to_string()))?
    } else {
        body.to_vec()
    };
    Ok((header, state))
}

/// Header optionally prefixed to delta records.
///
/// Layout (little-endian): `checksum:u32`, `header_sz:u32`, `uuid:16 bytes`.
/// The checksum is a CRC-32 of the header bytes starting at the `header_sz`
/// field. Absence is detected by a failed size check or a checksum mismatch,
/// in which case the whole payload is user bytes and the header is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeltaHeader {
    pub checksum: u32,
    pub header_sz: u32,
    pub uuid: Uuid,
}

impl DeltaHeader {
    /// Full size written by this implementation.
    pub const SIZE: usize = 4 + 4 + 16;
    /// Smallest header any writer could have emitted: checksum + header_sz.
    const MIN_SIZE: usize = 8;

    /// The delta carried no recoverable header.
    pub fn is_nil(&self) -> bool {
        self.header_sz == 0
    }

    /// UUID, if the header carried a non-nil one.
    pub fn uuid(&self) -> Option<Uuid> {
        if self.is_nil() || self.uuid.is_nil() {
            None
        } else {
            Some(self.uuid)
        }
    }

    /// Prefix `user_payload` with a fresh header carrying `uuid`.
    pub fn encode_payload(uuid: Uuid, user_payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE + user_payload.len()];
        buf[4..8].copy_from_slice(&(Self::SIZE as u32).to_le_bytes());
        buf[8..24].copy_from_slice(uuid.as_bytes());
        let checksum = crc32fast::hash(&buf[4..Self::SIZE]);
        buf[0..4].copy_from_slice(&checksum.to_le_bytes());
        buf[Self::SIZE..].copy_from_slice(user_payload);
        buf
    }

    /// Recover a header from the front of `payload`. Returns the header
    /// (zeroed if absent) and the offset where the user bytes begin.
    pub fn decode(payload: &[u8]) -> (Self, usize) {
        if payload.len() < Self::MIN_SIZE {
            return (Self::default(), 0);
        }

        let checksum = read_u32(payload, 0);
        let header_sz = read_u32(payload, 4) as usize;
        if header_sz < Self::MIN_SIZE || header_sz > payload.len() {
            return (Self::default(), 0);
        }
        if crc32fast::hash(&payload[4..header_sz]) != checksum {
            return (Self::default(), 0);
        }

        // A shorter header from an old writer leaves the uuid zeroed; a
        // longer one from a newer writer is truncated to what we understand.
        let mut uuid_bytes = [0u8; 16];
        let available = header_sz.min(Self::SIZE).saturating_sub(8);
        uuid_bytes[..available].copy_from_slice(&payload[8..8 + available]);

        let header = DeltaHeader {
            checksum,
            header_sz: header_sz as u32,
            uuid: Uuid::from_bytes(uuid_bytes),
        };
        (header, header_sz)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_v1() -> SnapshotHeader {
        SnapshotHeader {
            format_version: SnapshotHeader::FORMAT_WITH_READ_PTR,
            flags: 0,
            byte_offset: 4096,
            offset: 17,
            base_version: Lsn(42),
            delta_log_read_ptr: Lsn(50),
        }
    }

    #[test]
    fn test_snapshot_roundtrip_uncompressed() {
        let state = b"some serialized state".to_vec();
        let buf = encode_snapshot(header_v1(), &state, false).unwrap();

        let (header, body) = decode_snapshot(&buf).unwrap();
        assert_eq!(header.base_version, Lsn(42));
        assert_eq!(header.delta_log_read_ptr, Lsn(50));
        assert_eq!(header.byte_offset, 4096);
        assert_eq!(header.offset, 17);
        assert!(!header.is_compressed());
        assert_eq!(body, state);
    }

    #[test]
    fn test_snapshot_roundtrip_compressed() {
        let state = vec![7u8; 100_000];
        let buf = encode_snapshot(header_v1(), &state, true).unwrap();
        assert!(buf.len() < state.len());

        let (header, body) = decode_snapshot(&buf).unwrap();
        assert!(header.is_compressed());
        assert_eq!(header.base_version, Lsn(42));
        assert_eq!(body, state);
    }

    #[test]
    fn test_snapshot_base_format_has_no_read_ptr() {
        let header = SnapshotHeader {
            format_version: SnapshotHeader::FORMAT_BASE,
            delta_log_read_ptr: Lsn(99),
            ..header_v1()
        };
        let buf = encode_snapshot(header, b"x", false).unwrap();
        assert_eq!(
            buf.len(),
            SnapshotHeader::encoded_len(SnapshotHeader::FORMAT_BASE) + 1
        );

        let (parsed, _) = decode_snapshot(&buf).unwrap();
        assert_eq!(parsed.delta_log_read_ptr, Lsn::INVALID);
        assert_eq!(parsed.base_version, Lsn(42));
    }

    #[test]
    fn test_snapshot_truncated_header() {
        let err = SnapshotHeader::deserialize(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, RsmError::TruncatedSnapshotHeader(10)));
    }

    #[test]
    fn test_delta_header_roundtrip() {
        let uuid = Uuid::new_v4();
        let buf = DeltaHeader::encode_payload(uuid, b"user bytes");

        let (header, body_at) = DeltaHeader::decode(&buf);
        assert_eq!(header.uuid(), Some(uuid));
        assert_eq!(body_at, DeltaHeader::SIZE);
        assert_eq!(&buf[body_at..], b"user bytes");
    }

    #[test]
    fn test_headerless_delta_tolerated() {
        // Too short for any header.
        let (header, at) = DeltaHeader::decode(b"hi");
        assert!(header.is_nil());
        assert_eq!(at, 0);

        // Long enough but the checksum cannot match.
        let raw = vec![0xAB; 64];
        let (header, at) = DeltaHeader::decode(&raw);
        assert!(header.is_nil());
        assert_eq!(at, 0);
    }

    #[test]
    fn test_corrupted_delta_header_treated_as_headerless() {
        let uuid = Uuid::new_v4();
        let mut buf = DeltaHeader::encode_payload(uuid, b"payload");
        buf[9] ^= 0xFF;

        let (header, at) = DeltaHeader::decode(&buf);
        assert!(header.is_nil());
        assert_eq!(at, 0);
    }

    #[test]
    fn test_oversized_delta_header_skipped_past() {
        // A future writer with a 32-byte header: uuid still sits at offset 8.
        let uuid = Uuid::new_v4();
        let mut buf = vec![0u8; 32 + 4];
        buf[4..8].copy_from_slice(&32u32.to_le_bytes());
        buf[8..24].copy_from_slice(uuid.as_bytes());
        let checksum = crc32fast::hash(&buf[4..32]);
        buf[0..4].copy_from_slice(&checksum.to_le_bytes());
        buf[32..].copy_from_slice(b"data");

        let (header, at) = DeltaHeader::decode(&buf);
        assert_eq!(header.uuid(), Some(uuid));
        assert_eq!(at, 32);
        assert_eq!(&buf[at..], b"data");
    }
}

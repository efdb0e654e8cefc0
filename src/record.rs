//! On-disk framing of a single journal entry.
//!
//! ```text
//! offset  size  field
//! 0       4     length    (bytes of index + asqn + payload, 0 = unwritten)
//! 4       4     checksum  (crc32 of the same bytes)
//! 8       8     index     (i64)
//! 16      8     asqn      (i64, -1 when unset)
//! 24      n     payload
//! ```
//!
//! Frames are padded to `RECORD_ALIGN` so the length word of every frame can
//! be loaded and stored atomically. The writer stores the length word last;
//! a zero length marks the end of written data.

use crc32fast::Hasher;

use crate::mmap::MmapFile;

pub const FRAME_HEADER_SIZE: usize = 8;
pub const METADATA_SIZE: usize = 16;
pub const RECORD_ALIGN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - METADATA_SIZE;

/// ASQN value of records that carry no application sequence number.
pub const ASQN_IGNORE: i64 = -1;

pub const LENGTH_OFFSET: usize = 0;
pub const CHECKSUM_OFFSET: usize = 4;
pub const BODY_OFFSET: usize = FRAME_HEADER_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    pub index: i64,
    pub asqn: i64,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl JournalRecord {
    pub fn new(index: i64, asqn: i64, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let checksum = checksum(index, asqn, &payload);
        Self {
            index,
            asqn,
            checksum,
            payload,
        }
    }

    pub fn has_asqn(&self) -> bool {
        self.asqn != ASQN_IGNORE
    }

    pub fn is_checksum_valid(&self) -> bool {
        checksum(self.index, self.asqn, &self.payload) == self.checksum
    }

    /// Bytes this record occupies in a segment, padding included.
    pub fn frame_len(&self) -> usize {
        frame_len(self.payload.len())
    }
}

pub fn encode_metadata(index: i64, asqn: i64) -> [u8; METADATA_SIZE] {
    let mut buf = [0u8; METADATA_SIZE];
    buf[0..8].copy_from_slice(&index.to_le_bytes());
    buf[8..16].copy_from_slice(&asqn.to_le_bytes());
    buf
}

pub fn checksum(index: i64, asqn: i64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&encode_metadata(index, asqn));
    hasher.update(payload);
    hasher.finalize()
}

pub fn frame_len(payload_len: usize) -> usize {
    align_up(FRAME_HEADER_SIZE + METADATA_SIZE + payload_len, RECORD_ALIGN)
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Result of decoding the frame at a given offset.
#[derive(Debug)]
pub enum Frame {
    /// A complete, checksum-valid record spanning `len` bytes.
    Record { record: JournalRecord, len: usize },
    /// No frame has been written at this offset.
    End,
    /// Bytes are present but do not form a valid frame.
    Invalid(&'static str),
}

pub fn read_frame(map: &MmapFile, offset: usize) -> Frame {
    if offset + FRAME_HEADER_SIZE > map.len() {
        return Frame::End;
    }
    let length = match map.load_u32_acquire(offset + LENGTH_OFFSET) {
        Ok(length) => length as usize,
        Err(_) => return Frame::Invalid("unaligned frame offset"),
    };
    if length == 0 {
        return Frame::End;
    }
    if length < METADATA_SIZE {
        return Frame::Invalid("frame shorter than metadata");
    }
    let len = align_up(FRAME_HEADER_SIZE + length, RECORD_ALIGN);
    if offset + len > map.len() {
        return Frame::Invalid("frame exceeds segment bounds");
    }
    let (expected, body) = match (
        map.range(offset + CHECKSUM_OFFSET, 4),
        map.range(offset + BODY_OFFSET, length),
    ) {
        (Ok(crc), Ok(body)) => (read_u32(crc), body),
        _ => return Frame::Invalid("frame exceeds segment bounds"),
    };
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected {
        return Frame::Invalid("checksum mismatch");
    }
    let index = read_i64(&body[0..8]);
    let asqn = read_i64(&body[8..16]);
    Frame::Record {
        record: JournalRecord {
            index,
            asqn,
            checksum: expected,
            payload: body[METADATA_SIZE..].to_vec(),
        },
        len,
    }
}

/// Write a frame at `offset` and publish it by storing the length word last.
pub(crate) fn write_frame(map: &MmapFile, offset: usize, record: &JournalRecord) -> crate::Result<usize> {
    if record.payload.len() > MAX_PAYLOAD_LEN {
        return Err(crate::Error::PayloadTooLarge);
    }
    let length = METADATA_SIZE + record.payload.len();
    map.write_at(offset + BODY_OFFSET, &encode_metadata(record.index, record.asqn))?;
    if !record.payload.is_empty() {
        map.write_at(offset + BODY_OFFSET + METADATA_SIZE, &record.payload)?;
    }
    map.write_at(offset + CHECKSUM_OFFSET, &record.checksum.to_le_bytes())?;
    map.store_u32_release(offset + LENGTH_OFFSET, length as u32)?;
    Ok(record.frame_len())
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

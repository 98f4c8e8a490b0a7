//! On-media record codec
//!
//! Every stored fragment is one self-describing record:
//!
//! ```text
//! +--------------------+  offset 0
//! | header (28 bytes)  |  hdr_crc, size0, version, frag_next,
//! | + 4 zero bytes     |  key_permissions, vlength, klength, reserved[3]
//! +--------------------+  32
//! | key + NUL, padded  |  klength bytes
//! +--------------------+
//! | value, padded      |  pad16(vlength) bytes
//! +--------------------+
//! | tail (16 bytes)    |  flags, reserved0, size1, final_crc
//! +--------------------+  size0
//! ```
//!
//! All integers are little-endian. Every region boundary falls on a
//! [`CHUNK_SIZE`] boundary, so the tail can be rewritten on its own when a
//! record is finalized.

use crate::error::CorruptionKind;
use crate::flags::Permissions;
use crate::validation::{KeyName, KEY_NAME_MAX_LENGTH};
use serde::{Deserialize, Serialize};

/// Minimum addressable/erasable unit of the medium
pub const CHUNK_SIZE: usize = 16;

/// Header size on media, rounded up to the chunk boundary
pub const HEADER_SIZE: usize = 32;

/// Packed header fields without the alignment padding
pub const HEADER_PACKED_SIZE: usize = 28;

pub const TAIL_SIZE: usize = 16;

/// All-ones size field: the slot is erased
pub const SIZE_SENTINEL: u32 = u32::MAX;

/// All-ones link field: this is the last fragment
pub const LINK_SENTINEL: u32 = u32::MAX;

/// Largest padded key region (220 characters + NUL, rounded up)
pub const KEY_REGION_MAX: usize = pad_to_chunk(KEY_NAME_MAX_LENGTH + 1);

/// Round `len` up to a multiple of [`CHUNK_SIZE`]
pub const fn pad_to_chunk(len: usize) -> usize {
    (len + CHUNK_SIZE - 1) / CHUNK_SIZE * CHUNK_SIZE
}

/// Padded key region length for a key of `key_len` bytes
pub const fn key_region_len(key_len: usize) -> usize {
    pad_to_chunk(key_len + 1)
}

/// Total on-media size of a record
pub const fn encoded_len(key_len: usize, value_len: usize) -> usize {
    HEADER_SIZE + key_region_len(key_len) + pad_to_chunk(value_len) + TAIL_SIZE
}

/// Link from one fragment to the next, as a chunk index on the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentLink {
    /// No further fragments
    Last,
    /// Next fragment starts at this chunk
    At(u32),
}

impl FragmentLink {
    pub fn from_word(word: u32) -> Self {
        if word == LINK_SENTINEL {
            FragmentLink::Last
        } else {
            FragmentLink::At(word)
        }
    }

    pub fn to_word(self) -> u32 {
        match self {
            FragmentLink::Last => LINK_SENTINEL,
            FragmentLink::At(chunk) => chunk,
        }
    }

    pub fn is_last(self) -> bool {
        matches!(self, FragmentLink::Last)
    }
}

bitflags::bitflags! {
    /// Tail flags word
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[serde(transparent)]
    pub struct RecordFlags: u32 {
        /// Record is complete and visible to readers
        const FINALIZED = 1 << 0;
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub hdr_crc: u32,
    pub size0: u32,
    pub version: u32,
    pub frag_next: u32,
    pub key_permissions: u32,
    pub vlength: u32,
    pub klength: u8,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.hdr_crc.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size0.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.frag_next.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.key_permissions.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.vlength.to_le_bytes());
        bytes[24] = self.klength;
        // reserved[3] and alignment padding stay zero
        bytes
    }

    /// Parse the raw fields; `bytes` must hold at least [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        RecordHeader {
            hdr_crc: read_u32(bytes, 0),
            size0: read_u32(bytes, 4),
            version: read_u32(bytes, 8),
            frag_next: read_u32(bytes, 12),
            key_permissions: read_u32(bytes, 16),
            vlength: read_u32(bytes, 20),
            klength: bytes[24],
        }
    }
}

/// Decoded record tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTail {
    pub flags: u32,
    pub reserved0: u32,
    pub size1: u32,
    pub final_crc: u32,
}

impl RecordTail {
    pub fn to_bytes(&self) -> [u8; TAIL_SIZE] {
        let mut bytes = [0u8; TAIL_SIZE];
        bytes[0..4].copy_from_slice(&self.flags.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.reserved0.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.size1.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.final_crc.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        RecordTail {
            flags: read_u32(bytes, 0),
            reserved0: read_u32(bytes, 4),
            size1: read_u32(bytes, 8),
            final_crc: read_u32(bytes, 12),
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// CRC32 over the header fields after `hdr_crc` plus the key region
fn header_checksum(header_and_key: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_and_key[4..]);
    hasher.finalize()
}

/// CRC32 over the whole record except its trailing checksum word
fn record_checksum(record: &[u8]) -> u32 {
    crc32fast::hash(&record[..record.len() - 4])
}

/// One stored value fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: KeyName,
    pub value: Vec<u8>,
    pub version: u32,
    pub next: FragmentLink,
    pub permissions: Permissions,
    pub flags: RecordFlags,
}

impl Record {
    /// A new, unlinked, not yet finalized fragment
    pub fn new(key: KeyName, value: Vec<u8>, version: u32, permissions: Permissions) -> Self {
        Record {
            key,
            value,
            version,
            next: FragmentLink::Last,
            permissions,
            flags: RecordFlags::empty(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.flags.contains(RecordFlags::FINALIZED)
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len(self.key.as_str().len(), self.value.len())
    }

    /// Byte offset of the tail within the encoded record
    pub fn tail_offset(&self) -> usize {
        self.encoded_len() - TAIL_SIZE
    }

    /// Serialize to the on-media layout
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key.as_str().as_bytes();
        let klength = key_region_len(key.len());
        let size = self.encoded_len();

        let mut bytes = Vec::with_capacity(size);
        let header = RecordHeader {
            hdr_crc: 0,
            size0: size as u32,
            version: self.version,
            frag_next: self.next.to_word(),
            key_permissions: self.permissions.to_word(),
            vlength: self.value.len() as u32,
            klength: klength as u8,
        };
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(key);
        bytes.resize(HEADER_SIZE + klength, 0);

        let crc = header_checksum(&bytes);
        bytes[0..4].copy_from_slice(&crc.to_le_bytes());

        bytes.extend_from_slice(&self.value);
        bytes.resize(size - TAIL_SIZE, 0);

        let tail = RecordTail {
            flags: self.flags.bits(),
            reserved0: 0,
            size1: size as u32,
            final_crc: 0,
        };
        bytes.extend_from_slice(&tail.to_bytes());

        let crc = record_checksum(&bytes);
        bytes[size - 4..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }
}

/// Outcome of decoding one slot of the medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// A structurally sound record (finalized or not)
    Record(Record),
    /// Erased space to skip
    Erased { len: usize },
}

/// Decode the slot at the start of `window`
///
/// `Erased` covers both a never-written slot (header size sentinel, one
/// chunk) and a record whose header landed but whose tail never did (tail
/// size sentinel, `size0` bytes).
pub fn decode(window: &[u8]) -> std::result::Result<Slot, CorruptionKind> {
    if window.len() >= 8 && read_u32(window, 4) == SIZE_SENTINEL {
        return Ok(Slot::Erased { len: CHUNK_SIZE });
    }
    if window.len() < HEADER_SIZE {
        return Err(CorruptionKind::Truncated);
    }

    let header = RecordHeader::from_bytes(window);
    let klength = header.klength as usize;
    // A key region we cannot even delimit means the header bytes are bad
    if klength == 0 || klength % CHUNK_SIZE != 0 || klength > KEY_REGION_MAX {
        return Err(CorruptionKind::HeaderChecksum);
    }
    let value_start = HEADER_SIZE + klength;
    if window.len() < value_start {
        return Err(CorruptionKind::Truncated);
    }
    if header_checksum(&window[..value_start]) != header.hdr_crc {
        return Err(CorruptionKind::HeaderChecksum);
    }

    let size = header.size0 as usize;
    let vlength = header.vlength as usize;
    if size != HEADER_SIZE + klength + pad_to_chunk(vlength) + TAIL_SIZE {
        return Err(CorruptionKind::Layout);
    }
    let key = parse_key_region(&window[HEADER_SIZE..value_start])?;

    if window.len() < size {
        return Err(CorruptionKind::Truncated);
    }
    let tail = RecordTail::from_bytes(&window[size - TAIL_SIZE..size]);
    if tail.size1 == SIZE_SENTINEL {
        return Ok(Slot::Erased { len: size });
    }
    if tail.size1 != header.size0 {
        return Err(CorruptionKind::SizeMismatch);
    }
    if record_checksum(&window[..size]) != tail.final_crc {
        return Err(CorruptionKind::TailChecksum);
    }

    Ok(Slot::Record(Record {
        key,
        value: window[value_start..value_start + vlength].to_vec(),
        version: header.version,
        next: FragmentLink::from_word(header.frag_next),
        permissions: Permissions::from_word(header.key_permissions),
        flags: RecordFlags::from_bits_truncate(tail.flags),
    }))
}

fn parse_key_region(region: &[u8]) -> std::result::Result<KeyName, CorruptionKind> {
    let nul = region
        .iter()
        .position(|&b| b == 0)
        .ok_or(CorruptionKind::Layout)?;
    if region[nul..].iter().any(|&b| b != 0) {
        return Err(CorruptionKind::Layout);
    }
    let key = std::str::from_utf8(&region[..nul]).map_err(|_| CorruptionKind::Layout)?;
    KeyName::new(key).map_err(|_| CorruptionKind::Layout)
}

/// Size field from a header whose checksum has already been verified
pub fn trusted_size(window: &[u8]) -> Option<usize> {
    if window.len() < HEADER_SIZE {
        return None;
    }
    let size = read_u32(window, 4);
    (size != SIZE_SENTINEL && size as usize % CHUNK_SIZE == 0).then_some(size as usize)
}

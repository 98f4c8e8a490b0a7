//! Error types and status codes for config store operations
//!
//! Every failure carries a stable negative status code (see [`CfstoreError::code`])
//! and [`strerror`] maps such a code back to a human-readable string.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Non-negative outcome of an operation that may have more to deliver
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Operation complete, nothing more to deliver
    Success = 0,
    /// Operation succeeded and more data/results are pending
    More = 1,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Why a record failed to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorruptionKind {
    /// Header checksum mismatch: size and version fields are untrustworthy
    HeaderChecksum,
    /// Tail checksum mismatch with a good header: torn or interrupted write
    TailChecksum,
    /// Header and tail size fields disagree
    SizeMismatch,
    /// The window ends before the record does
    Truncated,
    /// Field values are inconsistent with the record layout
    Layout,
}

impl std::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorruptionKind::HeaderChecksum => "header checksum mismatch",
            CorruptionKind::TailChecksum => "tail checksum mismatch",
            CorruptionKind::SizeMismatch => "header/tail size mismatch",
            CorruptionKind::Truncated => "record truncated",
            CorruptionKind::Layout => "inconsistent record layout",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum CfstoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Ambiguous match for '{pattern}': {matches} keys")]
    AmbiguousMatch { pattern: String, matches: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Corrupt record at offset {offset}: {kind}")]
    Corruption { offset: u64, kind: CorruptionKind },

    #[error("Buffer too small: {remaining} bytes remain to be read")]
    BufferTooSmall { remaining: u64 },

    #[error("Invalid key syntax: {0}")]
    InvalidKeySyntax(String),

    #[error("Record not finalized: {0}")]
    NotFinalized(String),

    #[error("Storage exhausted: cannot allocate {needed} bytes")]
    StorageExhausted { needed: u64 },

    #[error("Invalid or stale handle")]
    InvalidHandle,

    #[error("Unfinalized write already in progress for key: {0}")]
    WriteInProgress(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Fragment chain broken after {delivered} bytes")]
    Truncated { delivered: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Misaligned medium access: offset {offset}, length {len}")]
    Misaligned { offset: u64, len: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CfstoreError>;

// Negative status codes, stable across releases
const CODES: &[(i32, &str)] = &[
    (-1, "key not found"),
    (-2, "key already exists"),
    (-3, "key name matches more than one object"),
    (-4, "permission denied"),
    (-5, "record corrupted"),
    (-6, "buffer too small"),
    (-7, "invalid key name syntax"),
    (-8, "record not finalized"),
    (-9, "storage exhausted"),
    (-10, "invalid handle"),
    (-11, "write already in progress"),
    (-12, "invalid argument"),
    (-13, "fragment chain truncated"),
    (-14, "invalid configuration"),
    (-15, "misaligned storage access"),
    (-16, "storage medium I/O error"),
    (-17, "serialization error"),
];

impl CfstoreError {
    /// Negative status code for this error
    pub fn code(&self) -> i32 {
        match self {
            CfstoreError::NotFound(_) => -1,
            CfstoreError::AlreadyExists(_) => -2,
            CfstoreError::AmbiguousMatch { .. } => -3,
            CfstoreError::PermissionDenied(_) => -4,
            CfstoreError::Corruption { .. } => -5,
            CfstoreError::BufferTooSmall { .. } => -6,
            CfstoreError::InvalidKeySyntax(_) => -7,
            CfstoreError::NotFinalized(_) => -8,
            CfstoreError::StorageExhausted { .. } => -9,
            CfstoreError::InvalidHandle => -10,
            CfstoreError::WriteInProgress(_) => -11,
            CfstoreError::InvalidArgument(_) => -12,
            CfstoreError::Truncated { .. } => -13,
            CfstoreError::InvalidConfig(_) => -14,
            CfstoreError::Misaligned { .. } => -15,
            CfstoreError::Io(_) => -16,
            CfstoreError::Serialization(_) => -17,
        }
    }
}

/// Look up the description of a status code
///
/// Returns an empty string for codes this crate never produces.
///
/// ```
/// use cfstore::{strerror, CfstoreError};
///
/// let err = CfstoreError::NotFound("a.b".into());
/// assert_eq!(strerror(err.code()), "key not found");
/// assert_eq!(strerror(0), "success");
/// assert_eq!(strerror(-999), "");
/// ```
pub fn strerror(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "more data available",
        _ => CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, s)| *s)
            .unwrap_or(""),
    }
}

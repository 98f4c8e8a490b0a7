//! Flag sets carried by key descriptors and records
//!
//! The on-media permission word packs the ACL into bits 0-5 and the device
//! data security protection (DDSP) attributes into bits 6-15. DDSP bits are
//! stored low-active so an erased word (all ones) means "no protection
//! requested". Bits 16-31 are reserved and kept at 1.

use crate::error::{CfstoreError, Result};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Owner/other x read/write/execute permission bits
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[serde(transparent)]
    pub struct Acl: u32 {
        const OWNER_READ = 1 << 0;
        const OWNER_WRITE = 1 << 1;
        const OWNER_EXE = 1 << 2;
        const OTHER_READ = 1 << 3;
        const OTHER_WRITE = 1 << 4;
        const OTHER_EXE = 1 << 5;
    }
}

impl Acl {
    /// Owner read + write, nothing for anyone else
    pub const OWNER_RW: Acl = Acl::OWNER_READ.union(Acl::OWNER_WRITE);

    /// Write and execute are mutually exclusive within each group
    pub fn validate(self) -> Result<()> {
        if self.contains(Acl::OWNER_WRITE | Acl::OWNER_EXE) {
            return Err(CfstoreError::InvalidArgument(
                "owner write and execute are mutually exclusive".to_string(),
            ));
        }
        if self.contains(Acl::OTHER_WRITE | Acl::OTHER_EXE) {
            return Err(CfstoreError::InvalidArgument(
                "other write and execute are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Executable objects must be stored contiguously
    pub fn is_executable(self) -> bool {
        self.intersects(Acl::OWNER_EXE | Acl::OTHER_EXE)
    }

    /// Any permission granted to non-owners
    pub fn grants_other(self) -> bool {
        self.intersects(Acl::OTHER_READ | Acl::OTHER_WRITE | Acl::OTHER_EXE)
    }
}

bitflags::bitflags! {
    /// Device data security protection attributes
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[serde(transparent)]
    pub struct Ddsp: u32 {
        const NONE = 1 << 0;
        const WRITE_ONCE_READ_ONLY_MEMORY = 1 << 1;
        const ACCESS_CONTROL_LIST = 1 << 2;
        const ROLL_BACK_PROTECTION = 1 << 3;
        const IMMOVABLE = 1 << 4;
        const HARDENED_MALWARE = 1 << 5;
        const HARDENED_BOARD_LEVEL = 1 << 6;
        const HARDENED_CHIP_LEVEL = 1 << 7;
        const HARDENED_SIDE_CHANNEL = 1 << 8;
        const TAMPER_PROOF = 1 << 9;
    }
}

impl Ddsp {
    /// Protection requested by `self` that `available` does not provide
    pub fn unmet_by(self, available: Ddsp) -> Ddsp {
        (self - Ddsp::NONE).difference(available)
    }
}

bitflags::bitflags! {
    /// Open/create mode bits
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[serde(transparent)]
    pub struct KeyMode: u32 {
        /// Create the object; fails if a live object already has the name
        const CREATE = 1 << 0;
        /// Store the value as one contiguous record
        const CONTINUOUS = 1 << 1;
        /// Keep written data in the handle until flush or close
        const LAZY_FLUSH = 1 << 2;
        /// Store only whole chunks of each write
        const BLOCK_WRITE = 1 << 3;
        /// Place the record at `KeyDescriptor::offset_address`
        const ALLOC_AT_OFFSET = 1 << 4;
    }
}

/// Volatility class of a storage medium, least to most durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRetentionLevel {
    /// Only during device activity
    Volatile = 0,
    /// Survives sleep
    VolatileSleep = 1,
    /// Survives deep sleep
    VolatileDeepSleep = 2,
    /// Battery backed, device can be powered off
    NonVolatileBatteryBacked = 3,
    /// Internal non-volatile memory
    NonVolatileInternal = 4,
    /// External non-volatile memory
    NonVolatileExternal = 5,
}

impl DataRetentionLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Volatile),
            1 => Some(Self::VolatileSleep),
            2 => Some(Self::VolatileDeepSleep),
            3 => Some(Self::NonVolatileBatteryBacked),
            4 => Some(Self::NonVolatileInternal),
            5 => Some(Self::NonVolatileExternal),
            _ => None,
        }
    }
}

const ACL_MASK: u32 = 0x3F;
const DDSP_SHIFT: u32 = 6;
const DDSP_MASK: u32 = 0x3FF;
const RESERVED_BITS: u32 = 0xFFFF_0000;

/// ACL plus DDSP attributes of one record, as packed in the permission word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub acl: Acl,
    pub ddsp: Ddsp,
}

impl Permissions {
    pub fn new(acl: Acl, ddsp: Ddsp) -> Self {
        Permissions { acl, ddsp }
    }

    /// Pack into the on-media permission word
    pub fn to_word(self) -> u32 {
        let ddsp_low_active = !self.ddsp.bits() & DDSP_MASK;
        RESERVED_BITS | (ddsp_low_active << DDSP_SHIFT) | (self.acl.bits() & ACL_MASK)
    }

    /// Unpack an on-media permission word; unknown bits are dropped
    pub fn from_word(word: u32) -> Self {
        let acl = Acl::from_bits_truncate(word & ACL_MASK);
        let ddsp = Ddsp::from_bits_truncate(!(word >> DDSP_SHIFT) & DDSP_MASK);
        Permissions { acl, ddsp }
    }
}

#![forbid(unsafe_code)]
//! btrfs search key type and well-known id constants.
//!
//! A [`Key`] is the composite sort key of every item in a btrfs metadata
//! tree: `(objectid: u64, item_type: u8, offset: u64)`, ordered as one
//! 136-bit packed integer. This crate is pure value-type code — no I/O —
//! and is the foundation the record decoder and the range scanner build on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ── Well-known tree / objectid constants ────────────────────────────────────

pub const DEV_ITEMS_OBJECTID: u64 = 1;
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const CSUM_TREE_OBJECTID: u64 = 7;
pub const QUOTA_TREE_OBJECTID: u64 = 8;
pub const UUID_TREE_OBJECTID: u64 = 9;
pub const FREE_SPACE_TREE_OBJECTID: u64 = 10;
pub const DEV_STATS_OBJECTID: u64 = 0;
pub const BALANCE_OBJECTID: u64 = u64::MAX - 3;
pub const ORPHAN_OBJECTID: u64 = u64::MAX - 4;
pub const EXTENT_CSUM_OBJECTID: u64 = u64::MAX - 9;
pub const FIRST_FREE_OBJECTID: u64 = 256;
pub const LAST_FREE_OBJECTID: u64 = u64::MAX - 255;
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

// ── Item type discriminants ─────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const INODE_EXTREF_KEY: u8 = 13;
pub const XATTR_ITEM_KEY: u8 = 24;
pub const ORPHAN_ITEM_KEY: u8 = 48;
pub const DIR_LOG_ITEM_KEY: u8 = 60;
pub const DIR_LOG_INDEX_KEY: u8 = 72;
pub const DIR_ITEM_KEY: u8 = 84;
pub const DIR_INDEX_KEY: u8 = 96;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const CSUM_ITEM_KEY: u8 = 120;
pub const EXTENT_CSUM_KEY: u8 = 128;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const ROOT_BACKREF_KEY: u8 = 144;
pub const ROOT_REF_KEY: u8 = 156;
pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const TREE_BLOCK_REF_KEY: u8 = 176;
pub const EXTENT_DATA_REF_KEY: u8 = 178;
pub const SHARED_BLOCK_REF_KEY: u8 = 182;
pub const SHARED_DATA_REF_KEY: u8 = 184;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const FREE_SPACE_INFO_KEY: u8 = 198;
pub const FREE_SPACE_EXTENT_KEY: u8 = 199;
pub const FREE_SPACE_BITMAP_KEY: u8 = 200;
pub const DEV_EXTENT_KEY: u8 = 204;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;
pub const QGROUP_STATUS_KEY: u8 = 240;
pub const QGROUP_INFO_KEY: u8 = 242;
pub const QGROUP_LIMIT_KEY: u8 = 244;
pub const QGROUP_RELATION_KEY: u8 = 246;
pub const BALANCE_ITEM_KEY: u8 = 248;
pub const DEV_STATS_KEY: u8 = 249;
pub const DEV_REPLACE_KEY: u8 = 250;
pub const UUID_KEY_SUBVOL: u8 = 251;
pub const UUID_KEY_RECEIVED_SUBVOL: u8 = 252;
pub const STRING_ITEM_KEY: u8 = 253;

/// Symbolic name for a key objectid, following the kernel's print style.
///
/// Some objectid values are overloaded (e.g. 1 is both `ROOT_TREE` and
/// `DEV_ITEMS`), so the item type disambiguates.
#[must_use]
pub fn key_objectid_str(objectid: u64, item_type: u8) -> Option<&'static str> {
    match objectid {
        ROOT_TREE_OBJECTID if item_type == DEV_ITEM_KEY => Some("DEV_ITEMS"),
        ROOT_TREE_OBJECTID => Some("ROOT_TREE"),
        FIRST_CHUNK_TREE_OBJECTID if item_type == CHUNK_ITEM_KEY => Some("FIRST_CHUNK_TREE"),
        EXTENT_TREE_OBJECTID => Some("EXTENT_TREE"),
        CHUNK_TREE_OBJECTID => Some("CHUNK_TREE"),
        ORPHAN_OBJECTID => Some("ORPHAN"),
        u64::MAX => Some("-1"),
        _ => None,
    }
}

fn parse_objectid_str(text: &str) -> Option<u64> {
    match text {
        "ROOT_TREE" | "DEV_ITEMS" => Some(ROOT_TREE_OBJECTID),
        "EXTENT_TREE" => Some(EXTENT_TREE_OBJECTID),
        "CHUNK_TREE" => Some(CHUNK_TREE_OBJECTID),
        "FIRST_CHUNK_TREE" => Some(FIRST_CHUNK_TREE_OBJECTID),
        "ORPHAN" => Some(ORPHAN_OBJECTID),
        "-1" => Some(u64::MAX),
        _ => None,
    }
}

/// Symbolic name for an item type discriminant.
#[must_use]
pub fn key_type_str(item_type: u8) -> Option<&'static str> {
    let name = match item_type {
        INODE_ITEM_KEY => "INODE_ITEM",
        INODE_REF_KEY => "INODE_REF",
        INODE_EXTREF_KEY => "INODE_EXTREF",
        XATTR_ITEM_KEY => "XATTR_ITEM",
        ORPHAN_ITEM_KEY => "ORPHAN_ITEM",
        DIR_LOG_ITEM_KEY => "DIR_LOG_ITEM",
        DIR_LOG_INDEX_KEY => "DIR_LOG_INDEX",
        DIR_ITEM_KEY => "DIR_ITEM",
        DIR_INDEX_KEY => "DIR_INDEX",
        EXTENT_DATA_KEY => "EXTENT_DATA",
        CSUM_ITEM_KEY => "CSUM_ITEM",
        EXTENT_CSUM_KEY => "EXTENT_CSUM",
        ROOT_ITEM_KEY => "ROOT_ITEM",
        ROOT_BACKREF_KEY => "ROOT_BACKREF",
        ROOT_REF_KEY => "ROOT_REF",
        EXTENT_ITEM_KEY => "EXTENT_ITEM",
        METADATA_ITEM_KEY => "METADATA_ITEM",
        TREE_BLOCK_REF_KEY => "TREE_BLOCK_REF",
        EXTENT_DATA_REF_KEY => "EXTENT_DATA_REF",
        SHARED_BLOCK_REF_KEY => "SHARED_BLOCK_REF",
        SHARED_DATA_REF_KEY => "SHARED_DATA_REF",
        BLOCK_GROUP_ITEM_KEY => "BLOCK_GROUP_ITEM",
        FREE_SPACE_INFO_KEY => "FREE_SPACE_INFO",
        FREE_SPACE_EXTENT_KEY => "FREE_SPACE_EXTENT",
        FREE_SPACE_BITMAP_KEY => "FREE_SPACE_BITMAP",
        DEV_EXTENT_KEY => "DEV_EXTENT",
        DEV_ITEM_KEY => "DEV_ITEM",
        CHUNK_ITEM_KEY => "CHUNK_ITEM",
        QGROUP_STATUS_KEY => "QGROUP_STATUS",
        QGROUP_INFO_KEY => "QGROUP_INFO",
        QGROUP_LIMIT_KEY => "QGROUP_LIMIT",
        QGROUP_RELATION_KEY => "QGROUP_RELATION",
        BALANCE_ITEM_KEY => "BALANCE_ITEM",
        DEV_STATS_KEY => "DEV_STATS",
        DEV_REPLACE_KEY => "DEV_REPLACE",
        UUID_KEY_SUBVOL => "UUID_SUBVOL",
        UUID_KEY_RECEIVED_SUBVOL => "RECEIVED_SUBVOL",
        STRING_ITEM_KEY => "STRING_ITEM",
        _ => return None,
    };
    Some(name)
}

fn parse_type_str(text: &str) -> Option<u8> {
    // The printable set is small; scan it rather than maintaining a
    // second map that can drift out of sync.
    (0..=u8::MAX).find(|t| key_type_str(*t) == Some(text))
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// A key field constructed from raw unpacked values exceeds its declared
/// width. This is a programmer error, not a recoverable input problem.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("key field {field} value {value:#x} exceeds its {bits}-bit width")]
pub struct FieldOverflow {
    pub field: &'static str,
    pub value: u128,
    pub bits: u32,
}

/// Malformed human-readable key text. Recoverable by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("key text must look like `(objectid type offset)`, got {0:?}")]
    Shape(String),
    #[error("unrecognized key objectid {0:?}")]
    Objectid(String),
    #[error("unrecognized key item type {0:?}")]
    ItemType(String),
    #[error("unrecognized key offset {0:?}")]
    Offset(String),
    #[error(transparent)]
    Overflow(#[from] FieldOverflow),
}

// ── Key ─────────────────────────────────────────────────────────────────────

/// A btrfs search key: `(objectid, item_type, offset)` compared as one
/// 136-bit packed unsigned integer.
///
/// The derived lexicographic field order is exactly the packed-integer
/// order (`objectid` occupies the top 64 bits, `item_type` the next 8,
/// `offset` the low 64); [`Key::to_be_bytes`] exposes the packed form.
///
/// Arithmetic via [`Key::wrapping_add`] / [`Key::wrapping_sub`] wraps
/// modulo 2^136 at both ends and exists solely to compute keys adjacent
/// to scan boundaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

/// Mask for the 72 bits above `offset` (objectid + item_type).
const HI_MASK: u128 = (1 << 72) - 1;

impl Key {
    /// The smallest possible key, `(0 0 0)`.
    pub const MIN: Self = Self::new(0, 0, 0);
    /// The largest possible key, `(-1 255 u64::MAX)`.
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Construct a key from unpacked wide fields, checking each field
    /// against its declared width.
    pub fn checked(objectid: u128, item_type: u32, offset: u128) -> Result<Self, FieldOverflow> {
        let objectid = u64::try_from(objectid).map_err(|_| FieldOverflow {
            field: "objectid",
            value: objectid,
            bits: 64,
        })?;
        let item_type = u8::try_from(item_type).map_err(|_| FieldOverflow {
            field: "item_type",
            value: u128::from(item_type),
            bits: 8,
        })?;
        let offset = u64::try_from(offset).map_err(|_| FieldOverflow {
            field: "offset",
            value: offset,
            bits: 64,
        })?;
        Ok(Self::new(objectid, item_type, offset))
    }

    /// Packed 136-bit big-endian representation (17 bytes).
    ///
    /// Byte comparison of the packed form agrees with `Ord` on the key.
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 17] {
        let mut out = [0_u8; 17];
        out[..8].copy_from_slice(&self.objectid.to_be_bytes());
        out[8] = self.item_type;
        out[9..].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 17]) -> Self {
        let mut objectid = [0_u8; 8];
        objectid.copy_from_slice(&bytes[..8]);
        let mut offset = [0_u8; 8];
        offset.copy_from_slice(&bytes[9..]);
        Self {
            objectid: u64::from_be_bytes(objectid),
            item_type: bytes[8],
            offset: u64::from_be_bytes(offset),
        }
    }

    /// `(packed + n) mod 2^136`. Wraps silently at [`Key::MAX`].
    #[must_use]
    pub fn wrapping_add(self, n: u64) -> Self {
        let (offset, carry) = self.offset.overflowing_add(n);
        let mut hi = (u128::from(self.objectid) << 8) | u128::from(self.item_type);
        if carry {
            hi = (hi + 1) & HI_MASK;
        }
        Self {
            objectid: key_hi_objectid(hi),
            item_type: key_hi_type(hi),
            offset,
        }
    }

    /// `(packed - n) mod 2^136`. Wraps silently at [`Key::MIN`].
    #[must_use]
    pub fn wrapping_sub(self, n: u64) -> Self {
        let (offset, borrow) = self.offset.overflowing_sub(n);
        let mut hi = (u128::from(self.objectid) << 8) | u128::from(self.item_type);
        if borrow {
            hi = hi.wrapping_sub(1) & HI_MASK;
        }
        Self {
            objectid: key_hi_objectid(hi),
            item_type: key_hi_type(hi),
            offset,
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // hi is masked to 72 bits
fn key_hi_objectid(hi: u128) -> u64 {
    (hi >> 8) as u64
}

#[allow(clippy::cast_possible_truncation)]
fn key_hi_type(hi: u128) -> u8 {
    (hi & 0xFF) as u8
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        match key_objectid_str(self.objectid, self.item_type) {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "{}", self.objectid)?,
        }
        write!(f, " ")?;
        match key_type_str(self.item_type) {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "{}", self.item_type)?,
        }
        write!(f, " {})", self.offset)
    }
}

impl FromStr for Key {
    type Err = KeyParseError;

    /// Parse the `(objectid type offset)` text form, accepting both the
    /// symbolic names `Display` emits and plain decimal fields.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        let inner = trimmed
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| KeyParseError::Shape(text.to_owned()))?;
        let fields: Vec<&str> = inner.split_whitespace().collect();
        let [objectid_text, type_text, offset_text] = fields[..] else {
            return Err(KeyParseError::Shape(text.to_owned()));
        };

        let objectid: u128 = match parse_objectid_str(objectid_text) {
            Some(value) => u128::from(value),
            None => objectid_text
                .parse()
                .map_err(|_| KeyParseError::Objectid(objectid_text.to_owned()))?,
        };
        let item_type: u32 = match parse_type_str(type_text) {
            Some(value) => u32::from(value),
            None => type_text
                .parse()
                .map_err(|_| KeyParseError::ItemType(type_text.to_owned()))?,
        };
        let offset: u128 = match offset_text {
            "-1" => u128::from(u64::MAX),
            _ => offset_text
                .parse()
                .map_err(|_| KeyParseError::Offset(offset_text.to_owned()))?,
        };

        Ok(Self::checked(objectid, item_type, offset)?)
    }
}

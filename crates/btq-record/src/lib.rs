#![forbid(unsafe_code)]
//! Decoding of raw btrfs metadata tree items into typed records.
//!
//! Pure decoding crate — no I/O, no side effects. A [`RawRecord`] is one
//! `(key, payload)` pair as returned by the tree-search transport; [`decode`]
//! turns it into the closed [`Item`] union. Unknown item types decode to
//! [`Item::Unknown`] so that newer kernels never break enumeration.
//!
//! Decoding is strict about payload length: every known item must consume
//! its payload exactly. Over- or under-consumption would mean the kind's
//! declared layout disagrees with what the kernel wrote, and nothing after
//! that point can be trusted.
//!
//! One deliberate exception to "decode everything up front": the free space
//! bitmap payload is kept verbatim, because expanding it into extents needs
//! the filesystem's sector size, which only the caller knows. See
//! [`FreeSpaceBitmap::unpack`].

use btq_key::{
    Key, BLOCK_GROUP_ITEM_KEY, CHUNK_ITEM_KEY, CSUM_ITEM_KEY, DEV_EXTENT_KEY, DEV_ITEM_KEY,
    DEV_STATS_KEY, DIR_INDEX_KEY, DIR_ITEM_KEY, EXTENT_CSUM_KEY, EXTENT_DATA_KEY,
    EXTENT_DATA_REF_KEY, EXTENT_ITEM_KEY, FREE_SPACE_BITMAP_KEY, FREE_SPACE_EXTENT_KEY,
    FREE_SPACE_INFO_KEY, INODE_EXTREF_KEY, INODE_ITEM_KEY, INODE_REF_KEY, METADATA_ITEM_KEY,
    ORPHAN_ITEM_KEY, ROOT_BACKREF_KEY, ROOT_ITEM_KEY, ROOT_REF_KEY, SHARED_BLOCK_REF_KEY,
    SHARED_DATA_REF_KEY, TREE_BLOCK_REF_KEY, XATTR_ITEM_KEY,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Block group / space flags ───────────────────────────────────────────────

pub const BLOCK_GROUP_SINGLE: u64 = 0;
pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
pub const BLOCK_GROUP_RAID1C4: u64 = 1 << 10;

pub const BLOCK_GROUP_TYPE_MASK: u64 =
    BLOCK_GROUP_DATA | BLOCK_GROUP_SYSTEM | BLOCK_GROUP_METADATA;

pub const BLOCK_GROUP_PROFILE_MASK: u64 = BLOCK_GROUP_RAID0
    | BLOCK_GROUP_RAID1
    | BLOCK_GROUP_RAID5
    | BLOCK_GROUP_RAID6
    | BLOCK_GROUP_DUP
    | BLOCK_GROUP_RAID10
    | BLOCK_GROUP_RAID1C3
    | BLOCK_GROUP_RAID1C4;

pub const SPACE_INFO_GLOBAL_RSV: u64 = 1 << 49;

// ── Extent flags ────────────────────────────────────────────────────────────

pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
pub const BLOCK_FLAG_FULL_BACKREF: u64 = 1 << 8;

// ── File extent types ───────────────────────────────────────────────────────

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/// Free space info flag: this block group's free space is stored as bitmaps.
pub const FREE_SPACE_USING_BITMAPS: u32 = 1 << 0;

fn flags_str(flags: u64, names: &[(u64, &'static str)]) -> String {
    let mut out = String::new();
    let mut rest = flags;
    for (bit, name) in names {
        if rest & bit != 0 {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(name);
            rest &= !bit;
        }
    }
    if rest != 0 {
        if !out.is_empty() {
            out.push('|');
        }
        out.push_str(&format!("{rest:#x}"));
    }
    if out.is_empty() {
        out.push_str("none");
    }
    out
}

/// Human-readable form of block group / chunk type flags, e.g. `DATA|RAID1`.
#[must_use]
pub fn block_group_flags_str(flags: u64) -> String {
    flags_str(
        flags,
        &[
            (BLOCK_GROUP_DATA, "DATA"),
            (BLOCK_GROUP_SYSTEM, "SYSTEM"),
            (BLOCK_GROUP_METADATA, "METADATA"),
            (BLOCK_GROUP_RAID0, "RAID0"),
            (BLOCK_GROUP_RAID1, "RAID1"),
            (BLOCK_GROUP_DUP, "DUP"),
            (BLOCK_GROUP_RAID10, "RAID10"),
            (BLOCK_GROUP_RAID5, "RAID5"),
            (BLOCK_GROUP_RAID6, "RAID6"),
            (BLOCK_GROUP_RAID1C3, "RAID1C3"),
            (BLOCK_GROUP_RAID1C4, "RAID1C4"),
            (SPACE_INFO_GLOBAL_RSV, "GLOBAL_RSV"),
        ],
    )
}

/// Human-readable form of extent item flags, e.g. `TREE_BLOCK|FULL_BACKREF`.
#[must_use]
pub fn extent_flags_str(flags: u64) -> String {
    flags_str(
        flags,
        &[
            (EXTENT_FLAG_DATA, "DATA"),
            (EXTENT_FLAG_TREE_BLOCK, "TREE_BLOCK"),
            (BLOCK_FLAG_FULL_BACKREF, "FULL_BACKREF"),
        ],
    )
}

// ── Raw record ──────────────────────────────────────────────────────────────

/// One raw item as returned by the tree-search transport: search key,
/// the transaction id it was committed in, and the item payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub key: Key,
    pub transid: u64,
    pub data: Vec<u8>,
}

impl RawRecord {
    #[must_use]
    pub fn new(key: Key, transid: u64, data: Vec<u8>) -> Self {
        Self { key, transid, data }
    }

    #[must_use]
    pub fn item_type(&self) -> u8 {
        self.key.item_type
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// A payload is inconsistent with its declared item type.
///
/// Fatal to the current scan group: a malformed record means the layout
/// assumption for this kind is wrong, so every later field boundary in the
/// stream is suspect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{key}: need {needed} payload bytes at offset {offset}, item has {actual}")]
    Truncated {
        key: Key,
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("{key}: decoded {consumed} of {len} payload bytes; trailing bytes are not allowed")]
    TrailingBytes { key: Key, consumed: usize, len: usize },
    #[error("{key}: invalid {field} ({reason})")]
    InvalidField {
        key: Key,
        field: &'static str,
        reason: &'static str,
    },
}

// ── Payload cursor ──────────────────────────────────────────────────────────

/// Sequential little-endian reader over one item payload.
///
/// All reads are bounds-checked against the payload; [`Cursor::finish`]
/// enforces the exact-consumption rule.
struct Cursor<'a> {
    key: Key,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a RawRecord) -> Self {
        Self {
            key: raw.key,
            data: &raw.data,
            pos: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], RecordError> {
        let end = self.pos.checked_add(len).ok_or(RecordError::InvalidField {
            key: self.key,
            field: "length",
            reason: "payload offset overflow",
        })?;
        if end > self.data.len() {
            return Err(RecordError::Truncated {
                key: self.key,
                needed: len,
                offset: self.pos,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    fn u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RecordError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, RecordError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn uuid(&mut self) -> Result<[u8; 16], RecordError> {
        let b = self.bytes(16)?;
        let mut out = [0_u8; 16];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> Result<(), RecordError> {
        self.bytes(len).map(|_| ())
    }

    /// An embedded `btrfs_disk_key`: objectid, type, offset (17 bytes).
    fn disk_key(&mut self) -> Result<Key, RecordError> {
        let objectid = self.u64()?;
        let item_type = self.u8()?;
        let offset = self.u64()?;
        Ok(Key::new(objectid, item_type, offset))
    }

    fn timespec(&mut self) -> Result<Timespec, RecordError> {
        let sec = self.u64()?;
        let nsec = self.u32()?;
        Ok(Timespec { sec, nsec })
    }

    fn invalid(&self, field: &'static str, reason: &'static str) -> RecordError {
        RecordError::InvalidField {
            key: self.key,
            field,
            reason,
        }
    }

    fn finish(&self) -> Result<(), RecordError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(RecordError::TrailingBytes {
                key: self.key,
                consumed: self.pos,
                len: self.data.len(),
            })
        }
    }
}

// ── Decoded item types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

/// `btrfs_inode_item` (fixed 160 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

impl InodeItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let generation = c.u64()?;
        let transid = c.u64()?;
        let size = c.u64()?;
        let nbytes = c.u64()?;
        let block_group = c.u64()?;
        let nlink = c.u32()?;
        let uid = c.u32()?;
        let gid = c.u32()?;
        let mode = c.u32()?;
        let rdev = c.u64()?;
        let flags = c.u64()?;
        let sequence = c.u64()?;
        c.skip(32)?; // reserved
        Ok(Self {
            generation,
            transid,
            size,
            nbytes,
            block_group,
            nlink,
            uid,
            gid,
            mode,
            rdev,
            flags,
            sequence,
            atime: c.timespec()?,
            ctime: c.timespec()?,
            mtime: c.timespec()?,
            otime: c.timespec()?,
        })
    }
}

/// One back-reference inside an `INODE_REF` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRefEntry {
    pub index: u64,
    pub name: Vec<u8>,
}

/// `INODE_REF`: one or more (index, name) entries packed into one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub refs: Vec<InodeRefEntry>,
}

impl InodeRef {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let mut refs = Vec::new();
        while c.remaining() > 0 {
            let index = c.u64()?;
            let name_len = usize::from(c.u16()?);
            let name = c.bytes(name_len)?.to_vec();
            refs.push(InodeRefEntry { index, name });
        }
        Ok(Self { refs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeExtrefEntry {
    pub parent_objectid: u64,
    pub index: u64,
    pub name: Vec<u8>,
}

/// `INODE_EXTREF`: overflow form of inode back-references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeExtref {
    pub refs: Vec<InodeExtrefEntry>,
}

impl InodeExtref {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let mut refs = Vec::new();
        while c.remaining() > 0 {
            let parent_objectid = c.u64()?;
            let index = c.u64()?;
            let name_len = usize::from(c.u16()?);
            let name = c.bytes(name_len)?.to_vec();
            refs.push(InodeExtrefEntry {
                parent_objectid,
                index,
                name,
            });
        }
        Ok(Self { refs })
    }
}

/// One `btrfs_dir_item` entry: location key, transid, file type, name and
/// (for xattrs) attached data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub location: Key,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl DirEntry {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let location = c.disk_key()?;
        let transid = c.u64()?;
        let data_len = usize::from(c.u16()?);
        let name_len = usize::from(c.u16()?);
        let file_type = c.u8()?;
        let name = c.bytes(name_len)?.to_vec();
        let data = c.bytes(data_len)?.to_vec();
        Ok(Self {
            location,
            transid,
            file_type,
            name,
            data,
        })
    }
}

/// `DIR_ITEM`: hash-keyed directory entries. Hash collisions pack multiple
/// entries into one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirItem {
    pub entries: Vec<DirEntry>,
}

impl DirItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let mut entries = Vec::new();
        while c.remaining() > 0 {
            entries.push(DirEntry::parse(c)?);
        }
        Ok(Self { entries })
    }
}

/// `XATTR_ITEM`: same wire layout as a dir item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrItem {
    pub entries: Vec<DirEntry>,
}

/// `DIR_INDEX`: exactly one dir entry, keyed by directory index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirIndex {
    pub entry: DirEntry,
}

/// On-disk location of a regular (non-inline) file extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskExtent {
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtent {
    Inline { data: Vec<u8> },
    Regular(DiskExtent),
    Prealloc(DiskExtent),
}

/// `EXTENT_DATA`: a file extent item, inline or on-disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: u16,
    pub extent: FileExtent,
}

impl FileExtentItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let generation = c.u64()?;
        let ram_bytes = c.u64()?;
        let compression = c.u8()?;
        let encryption = c.u8()?;
        let other_encoding = c.u16()?;
        let extent_type = c.u8()?;
        let extent = match extent_type {
            FILE_EXTENT_INLINE => FileExtent::Inline {
                data: c.rest().to_vec(),
            },
            FILE_EXTENT_REG | FILE_EXTENT_PREALLOC => {
                let disk = DiskExtent {
                    disk_bytenr: c.u64()?,
                    disk_num_bytes: c.u64()?,
                    offset: c.u64()?,
                    num_bytes: c.u64()?,
                };
                if extent_type == FILE_EXTENT_REG {
                    FileExtent::Regular(disk)
                } else {
                    FileExtent::Prealloc(disk)
                }
            }
            _ => return Err(c.invalid("extent_type", "unknown file extent type")),
        };
        Ok(Self {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            extent,
        })
    }
}

/// `EXTENT_CSUM`: checksum bytes kept verbatim (the checksum width depends
/// on the filesystem's csum type, which the caller knows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentCsum {
    pub csums: Vec<u8>,
}

/// Extension fields present in post-v0 `ROOT_ITEM`s (439-byte layout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItemV2 {
    pub generation_v2: u64,
    pub uuid: [u8; 16],
    pub parent_uuid: [u8; 16],
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: Timespec,
    pub otime: Timespec,
    pub stime: Timespec,
    pub rtime: Timespec,
}

/// `ROOT_ITEM`: the root of a (sub)tree, v0 (239 bytes) or extended (439).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
    pub v2: Option<RootItemV2>,
}

const ROOT_ITEM_V0_SIZE: usize = 239;
const ROOT_ITEM_V2_SIZE: usize = 439;

impl RootItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let len = c.remaining();
        if len != ROOT_ITEM_V0_SIZE && len != ROOT_ITEM_V2_SIZE {
            return Err(c.invalid("length", "root item must be 239 (v0) or 439 bytes"));
        }
        let inode = InodeItem::parse(c)?;
        let generation = c.u64()?;
        let root_dirid = c.u64()?;
        let bytenr = c.u64()?;
        let byte_limit = c.u64()?;
        let bytes_used = c.u64()?;
        let last_snapshot = c.u64()?;
        let flags = c.u64()?;
        let refs = c.u32()?;
        let drop_progress = c.disk_key()?;
        let drop_level = c.u8()?;
        let level = c.u8()?;
        let v2 = if len == ROOT_ITEM_V2_SIZE {
            let generation_v2 = c.u64()?;
            let uuid = c.uuid()?;
            let parent_uuid = c.uuid()?;
            let received_uuid = c.uuid()?;
            let ctransid = c.u64()?;
            let otransid = c.u64()?;
            let stransid = c.u64()?;
            let rtransid = c.u64()?;
            let ctime = c.timespec()?;
            let otime = c.timespec()?;
            let stime = c.timespec()?;
            let rtime = c.timespec()?;
            c.skip(64)?; // reserved
            Some(RootItemV2 {
                generation_v2,
                uuid,
                parent_uuid,
                received_uuid,
                ctransid,
                otransid,
                stransid,
                rtransid,
                ctime,
                otime,
                stime,
                rtime,
            })
        } else {
            None
        };
        Ok(Self {
            inode,
            generation,
            root_dirid,
            bytenr,
            byte_limit,
            bytes_used,
            last_snapshot,
            flags,
            refs,
            drop_progress,
            drop_level,
            level,
            v2,
        })
    }
}

/// `ROOT_REF` / `ROOT_BACKREF`: subvolume parent/child naming link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

impl RootRef {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let dirid = c.u64()?;
        let sequence = c.u64()?;
        let name_len = usize::from(c.u16()?);
        let name = c.bytes(name_len)?.to_vec();
        Ok(Self {
            dirid,
            sequence,
            name,
        })
    }
}

/// A data back-reference: which (root, inode, file offset) points at an
/// extent, and how many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl ExtentDataRef {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        Ok(Self {
            root: c.u64()?,
            objectid: c.u64()?,
            offset: c.u64()?,
            count: c.u32()?,
        })
    }
}

/// A shared data back-reference: the tree block that owns the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataRef {
    pub parent: u64,
    pub count: u32,
}

/// A tree block back-reference keyed by owning root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlockRef {
    pub root: u64,
}

/// A shared tree block back-reference keyed by parent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBlockRef {
    pub parent: u64,
}

/// Embedded tree-block info inside a non-skinny metadata `EXTENT_ITEM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlockInfo {
    pub key: Key,
    pub level: u8,
    pub tree_block_refs: Vec<TreeBlockRef>,
    pub shared_block_refs: Vec<SharedBlockRef>,
}

/// `EXTENT_ITEM`: one allocated extent plus its inline back-references.
///
/// Additional back-references that did not fit inline arrive as separate
/// items sharing the extent's objectid; the aggregating scan layer appends
/// them to the vectors here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub vaddr: u64,
    pub length: u64,
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub extent_data_refs: Vec<ExtentDataRef>,
    pub shared_data_refs: Vec<SharedDataRef>,
    pub tree_block_info: Option<TreeBlockInfo>,
}

impl ExtentItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let vaddr = c.key.objectid;
        let length = c.key.offset;
        let refs = c.u64()?;
        let generation = c.u64()?;
        let flags = c.u64()?;
        let mut extent_data_refs = Vec::new();
        let mut shared_data_refs = Vec::new();
        let mut tree_block_info = None;

        if flags & EXTENT_FLAG_TREE_BLOCK != 0 {
            let key = c.disk_key()?;
            let level = c.u8()?;
            let mut info = TreeBlockInfo {
                key,
                level,
                tree_block_refs: Vec::new(),
                shared_block_refs: Vec::new(),
            };
            while c.remaining() > 0 {
                parse_inline_tree_ref(c, &mut info.tree_block_refs, &mut info.shared_block_refs)?;
            }
            tree_block_info = Some(info);
        } else if flags & EXTENT_FLAG_DATA != 0 {
            while c.remaining() > 0 {
                let ref_type = c.u8()?;
                match ref_type {
                    EXTENT_DATA_REF_KEY => extent_data_refs.push(ExtentDataRef::parse(c)?),
                    SHARED_DATA_REF_KEY => shared_data_refs.push(SharedDataRef {
                        parent: c.u64()?,
                        count: c.u32()?,
                    }),
                    _ => return Err(c.invalid("inline_ref", "unknown inline data ref type")),
                }
            }
        }
        // Other flag combinations carry no inline refs; finish() rejects
        // any leftover bytes.

        Ok(Self {
            vaddr,
            length,
            refs,
            generation,
            flags,
            extent_data_refs,
            shared_data_refs,
            tree_block_info,
        })
    }
}

fn parse_inline_tree_ref(
    c: &mut Cursor<'_>,
    tree_block_refs: &mut Vec<TreeBlockRef>,
    shared_block_refs: &mut Vec<SharedBlockRef>,
) -> Result<(), RecordError> {
    let ref_type = c.u8()?;
    let offset = c.u64()?;
    match ref_type {
        TREE_BLOCK_REF_KEY => tree_block_refs.push(TreeBlockRef { root: offset }),
        SHARED_BLOCK_REF_KEY => shared_block_refs.push(SharedBlockRef { parent: offset }),
        _ => return Err(c.invalid("inline_ref", "unknown inline tree block ref type")),
    }
    Ok(())
}

/// `METADATA_ITEM`: a skinny metadata extent (level in the key offset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub vaddr: u64,
    pub skinny_level: u64,
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub tree_block_refs: Vec<TreeBlockRef>,
    pub shared_block_refs: Vec<SharedBlockRef>,
}

impl MetadataItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let vaddr = c.key.objectid;
        let skinny_level = c.key.offset;
        let refs = c.u64()?;
        let generation = c.u64()?;
        let flags = c.u64()?;
        let mut tree_block_refs = Vec::new();
        let mut shared_block_refs = Vec::new();
        while c.remaining() > 0 {
            parse_inline_tree_ref(c, &mut tree_block_refs, &mut shared_block_refs)?;
        }
        Ok(Self {
            vaddr,
            skinny_level,
            refs,
            generation,
            flags,
            tree_block_refs,
            shared_block_refs,
        })
    }
}

/// `BLOCK_GROUP_ITEM`: usage accounting for one block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub vaddr: u64,
    pub length: u64,
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        Ok(Self {
            vaddr: c.key.objectid,
            length: c.key.offset,
            used: c.u64()?,
            chunk_objectid: c.u64()?,
            flags: c.u64()?,
        })
    }

    /// Used percentage, rounded to the nearest integer.
    #[must_use]
    pub fn used_pct(&self) -> u64 {
        if self.length == 0 {
            return 0;
        }
        (self.used * 100 + self.length / 2) / self.length
    }
}

/// `FREE_SPACE_INFO`: per-block-group free space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: u32,
}

/// `FREE_SPACE_EXTENT`: one contiguous run of free space. The payload is
/// empty; address and length live in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FreeSpaceExtent {
    pub vaddr: u64,
    pub length: u64,
}

/// `FREE_SPACE_BITMAP`: densely tracked free space, one bit per sector.
///
/// Kept verbatim at decode time; expansion into extents happens in
/// [`FreeSpaceBitmap::unpack`] once the caller supplies the sector size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceBitmap {
    pub vaddr: u64,
    pub length: u64,
    pub bitmap: Vec<u8>,
}

impl FreeSpaceBitmap {
    /// Expand the bitmap into maximal runs of set bits.
    ///
    /// Bit `i` (LSB-first within each byte) covers the `sectorsize` bytes at
    /// `vaddr + i * sectorsize`. A run still open at the end of the covered
    /// range is closed at `vaddr + length`.
    pub fn unpack(&self, sectorsize: u32) -> Result<Vec<FreeSpaceExtent>, RecordError> {
        if sectorsize == 0 {
            return Err(RecordError::InvalidField {
                key: Key::new(self.vaddr, FREE_SPACE_BITMAP_KEY, self.length),
                field: "sectorsize",
                reason: "must be non-zero",
            });
        }
        let stride = u64::from(sectorsize);
        let end = self.vaddr.saturating_add(self.length);
        let mut extents = Vec::new();
        let mut run_start: Option<u64> = None;
        let mut offset = self.vaddr;

        'scan: for byte in &self.bitmap {
            for bit in 0..8 {
                if offset >= end {
                    break 'scan;
                }
                let set = (byte >> bit) & 1 == 1;
                match (set, run_start) {
                    (true, None) => run_start = Some(offset),
                    (false, Some(start)) => {
                        extents.push(FreeSpaceExtent {
                            vaddr: start,
                            length: offset - start,
                        });
                        run_start = None;
                    }
                    _ => {}
                }
                offset = offset.saturating_add(stride);
            }
        }
        if let Some(start) = run_start {
            extents.push(FreeSpaceExtent {
                vaddr: start,
                length: end - start,
            });
        }
        Ok(extents)
    }
}

/// `DEV_EXTENT`: a physical slice of one device backing part of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtent {
    pub devid: u64,
    pub paddr: u64,
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: [u8; 16],
}

impl DevExtent {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        Ok(Self {
            devid: c.key.objectid,
            paddr: c.key.offset,
            chunk_tree: c.u64()?,
            chunk_objectid: c.u64()?,
            chunk_offset: c.u64()?,
            length: c.u64()?,
            chunk_tree_uuid: c.uuid()?,
        })
    }

    /// Virtual address of the chunk this extent backs.
    #[must_use]
    pub fn vaddr(&self) -> u64 {
        self.chunk_offset
    }
}

/// `DEV_ITEM`: one device of the filesystem (fixed 98 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

impl DevItem {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        Ok(Self {
            devid: c.u64()?,
            total_bytes: c.u64()?,
            bytes_used: c.u64()?,
            io_align: c.u32()?,
            io_width: c.u32()?,
            sector_size: c.u32()?,
            dev_type: c.u64()?,
            generation: c.u64()?,
            start_offset: c.u64()?,
            dev_group: c.u32()?,
            seek_speed: c.u8()?,
            bandwidth: c.u8()?,
            uuid: c.uuid()?,
            fsid: c.uuid()?,
        })
    }
}

/// One stripe of a chunk: which device, at which physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// `CHUNK_ITEM`: a slice of virtual address space and the device stripes
/// backing it. The stripe list is inline, sized by `num_stripes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub vaddr: u64,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        let vaddr = c.key.offset;
        let length = c.u64()?;
        let owner = c.u64()?;
        let stripe_len = c.u64()?;
        let chunk_type = c.u64()?;
        let io_align = c.u32()?;
        let io_width = c.u32()?;
        let sector_size = c.u32()?;
        let num_stripes = c.u16()?;
        let sub_stripes = c.u16()?;
        if num_stripes == 0 {
            return Err(c.invalid("num_stripes", "chunk must have at least one stripe"));
        }
        let mut stripes = Vec::with_capacity(usize::from(num_stripes));
        for _ in 0..num_stripes {
            stripes.push(Stripe {
                devid: c.u64()?,
                offset: c.u64()?,
                dev_uuid: c.uuid()?,
            });
        }
        Ok(Self {
            vaddr,
            length,
            owner,
            stripe_len,
            chunk_type,
            io_align,
            io_width,
            sector_size,
            num_stripes,
            sub_stripes,
            stripes,
        })
    }
}

/// `DEV_STATS` (persistent item): per-device error counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevStats {
    pub counters: Vec<u64>,
}

impl DevStats {
    fn parse(c: &mut Cursor<'_>) -> Result<Self, RecordError> {
        if c.remaining() % 8 != 0 {
            return Err(c.invalid("length", "dev stats payload must be a multiple of 8"));
        }
        let mut counters = Vec::with_capacity(c.remaining() / 8);
        while c.remaining() > 0 {
            counters.push(c.u64()?);
        }
        Ok(Self { counters })
    }
}

/// An item type this decoder does not know. The payload is preserved so
/// callers can still account for or dump it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownItem {
    pub item_type: u8,
    pub data: Vec<u8>,
}

// ── The closed item union ───────────────────────────────────────────────────

/// Every decoded item variant. Closed: unknown kinds land in
/// [`Item::Unknown`] rather than failing, so scans keep working against
/// kernels newer than this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    InodeItem(InodeItem),
    InodeRef(InodeRef),
    InodeExtref(InodeExtref),
    XattrItem(XattrItem),
    OrphanItem,
    DirItem(DirItem),
    DirIndex(DirIndex),
    FileExtentItem(FileExtentItem),
    CsumItem(ExtentCsum),
    ExtentCsum(ExtentCsum),
    RootItem(RootItem),
    RootBackref(RootRef),
    RootRef(RootRef),
    ExtentItem(ExtentItem),
    MetadataItem(MetadataItem),
    TreeBlockRef(TreeBlockRef),
    ExtentDataRef(ExtentDataRef),
    SharedBlockRef(SharedBlockRef),
    SharedDataRef(SharedDataRef),
    BlockGroupItem(BlockGroupItem),
    FreeSpaceInfo(FreeSpaceInfo),
    FreeSpaceExtent(FreeSpaceExtent),
    FreeSpaceBitmap(FreeSpaceBitmap),
    DevExtent(DevExtent),
    DevItem(DevItem),
    Chunk(Chunk),
    DevStats(DevStats),
    Unknown(UnknownItem),
}

/// Decode one raw record into its typed item.
///
/// Total over the item type: known kinds either decode fully (consuming the
/// payload exactly) or fail with [`RecordError`]; unknown kinds are kept
/// raw. Pure and stateless per record.
pub fn decode(raw: &RawRecord) -> Result<Item, RecordError> {
    let mut c = Cursor::new(raw);
    let key = raw.key;
    let item = match raw.item_type() {
        INODE_ITEM_KEY => Item::InodeItem(InodeItem::parse(&mut c)?),
        INODE_REF_KEY => Item::InodeRef(InodeRef::parse(&mut c)?),
        INODE_EXTREF_KEY => Item::InodeExtref(InodeExtref::parse(&mut c)?),
        XATTR_ITEM_KEY => Item::XattrItem(XattrItem {
            entries: DirItem::parse(&mut c)?.entries,
        }),
        ORPHAN_ITEM_KEY => Item::OrphanItem,
        DIR_ITEM_KEY => Item::DirItem(DirItem::parse(&mut c)?),
        DIR_INDEX_KEY => Item::DirIndex(DirIndex {
            entry: DirEntry::parse(&mut c)?,
        }),
        EXTENT_DATA_KEY => Item::FileExtentItem(FileExtentItem::parse(&mut c)?),
        CSUM_ITEM_KEY => Item::CsumItem(ExtentCsum {
            csums: c.rest().to_vec(),
        }),
        EXTENT_CSUM_KEY => Item::ExtentCsum(ExtentCsum {
            csums: c.rest().to_vec(),
        }),
        ROOT_ITEM_KEY => Item::RootItem(RootItem::parse(&mut c)?),
        ROOT_BACKREF_KEY => Item::RootBackref(RootRef::parse(&mut c)?),
        ROOT_REF_KEY => Item::RootRef(RootRef::parse(&mut c)?),
        EXTENT_ITEM_KEY => Item::ExtentItem(ExtentItem::parse(&mut c)?),
        METADATA_ITEM_KEY => Item::MetadataItem(MetadataItem::parse(&mut c)?),
        // The standalone back-reference items carry their payload in the
        // key: the offset field is the owning root / parent block.
        TREE_BLOCK_REF_KEY => Item::TreeBlockRef(TreeBlockRef { root: key.offset }),
        EXTENT_DATA_REF_KEY => Item::ExtentDataRef(ExtentDataRef::parse(&mut c)?),
        SHARED_BLOCK_REF_KEY => Item::SharedBlockRef(SharedBlockRef { parent: key.offset }),
        SHARED_DATA_REF_KEY => Item::SharedDataRef(SharedDataRef {
            parent: key.offset,
            count: c.u32()?,
        }),
        BLOCK_GROUP_ITEM_KEY => Item::BlockGroupItem(BlockGroupItem::parse(&mut c)?),
        FREE_SPACE_INFO_KEY => Item::FreeSpaceInfo(FreeSpaceInfo {
            extent_count: c.u32()?,
            flags: c.u32()?,
        }),
        FREE_SPACE_EXTENT_KEY => Item::FreeSpaceExtent(FreeSpaceExtent {
            vaddr: key.objectid,
            length: key.offset,
        }),
        FREE_SPACE_BITMAP_KEY => Item::FreeSpaceBitmap(FreeSpaceBitmap {
            vaddr: key.objectid,
            length: key.offset,
            bitmap: c.rest().to_vec(),
        }),
        DEV_EXTENT_KEY => Item::DevExtent(DevExtent::parse(&mut c)?),
        DEV_ITEM_KEY => Item::DevItem(DevItem::parse(&mut c)?),
        CHUNK_ITEM_KEY => Item::Chunk(Chunk::parse(&mut c)?),
        DEV_STATS_KEY => Item::DevStats(DevStats::parse(&mut c)?),
        other => {
            return Ok(Item::Unknown(UnknownItem {
                item_type: other,
                data: raw.data.clone(),
            }))
        }
    };
    c.finish()?;
    Ok(item)
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for DevItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev item devid {} total bytes {} bytes used {}",
            self.devid, self.total_bytes, self.bytes_used
        )
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk vaddr {} type {} length {} num_stripes {}",
            self.vaddr,
            block_group_flags_str(self.chunk_type),
            self.length,
            self.num_stripes
        )
    }
}

impl fmt::Display for Stripe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stripe devid {} offset {}", self.devid, self.offset)
    }
}

impl fmt::Display for DevExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev extent devid {} paddr {} length {} chunk {}",
            self.devid, self.paddr, self.length, self.chunk_offset
        )
    }
}

impl fmt::Display for BlockGroupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block group vaddr {} length {} flags {} used {} used_pct {}",
            self.vaddr,
            self.length,
            block_group_flags_str(self.flags),
            self.used,
            self.used_pct()
        )
    }
}

impl fmt::Display for ExtentItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "extent vaddr {} length {} refs {} gen {} flags {}",
            self.vaddr,
            self.length,
            self.refs,
            self.generation,
            extent_flags_str(self.flags)
        )
    }
}

impl fmt::Display for MetadataItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "metadata vaddr {} refs {} gen {} flags {} skinny level {}",
            self.vaddr,
            self.refs,
            self.generation,
            extent_flags_str(self.flags),
            self.skinny_level
        )
    }
}

impl fmt::Display for ExtentDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "extent data backref root {} objectid {} offset {} count {}",
            self.root, self.objectid, self.offset, self.count
        )
    }
}

impl fmt::Display for SharedDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shared data backref parent {} count {}",
            self.parent, self.count
        )
    }
}

impl fmt::Display for TreeBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree block backref root {}", self.root)
    }
}

impl fmt::Display for SharedBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared block backref parent {}", self.parent)
    }
}

impl fmt::Display for FreeSpaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free space info extent count {} flags {}",
            self.extent_count, self.flags
        )
    }
}

impl fmt::Display for FreeSpaceExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free space extent vaddr {} length {}",
            self.vaddr, self.length
        )
    }
}

impl fmt::Display for FreeSpaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free space bitmap for vaddr {} length {}",
            self.vaddr, self.length
        )
    }
}

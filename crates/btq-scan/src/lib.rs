#![forbid(unsafe_code)]
//! Paginated, resumable scans over btrfs metadata trees.
//!
//! The [`Transport`] trait abstracts the TREE_SEARCH-style backend: given a
//! tree and a key window, return a sorted batch of raw records. On top of it,
//! [`RangeScanner`] drives a capped, ordered, duplicate-free scan across
//! batch boundaries; [`Items`] decodes the stream; the aggregating iterators
//! ([`ExtentIter`], [`SubvolumeIter`], [`FreeSpaceIter`]) reassemble logical
//! objects that the trees store split across several items. [`TreeSearch`]
//! is the convenience client fixing tree id and key window per object
//! family.
//!
//! Everything here is synchronous and pull-based. A scanner owns its cursor
//! and current batch exclusively; independent scans need no coordination.
//! There is no retry policy: a transport failure is fatal to the scan, and
//! the caller resumes by starting a new scan from the last emitted key + 1.

use btq_key::{
    Key, BLOCK_GROUP_ITEM_KEY, CHUNK_ITEM_KEY, CHUNK_TREE_OBJECTID, DEV_ITEM_KEY,
    DEV_ITEMS_OBJECTID, DEV_TREE_OBJECTID, EXTENT_TREE_OBJECTID, FIRST_CHUNK_TREE_OBJECTID,
    FIRST_FREE_OBJECTID, FREE_SPACE_TREE_OBJECTID, LAST_FREE_OBJECTID, ORPHAN_ITEM_KEY,
    ORPHAN_OBJECTID, ROOT_ITEM_KEY, ROOT_TREE_OBJECTID,
};
use btq_record::{
    decode, BlockGroupItem, Chunk, DevExtent, DevItem, ExtentItem, FreeSpaceExtent, Item,
    MetadataItem, RawRecord, RecordError, RootItem,
};
use thiserror::Error;
use tracing::{debug, trace};

// ── Transport ───────────────────────────────────────────────────────────────

/// Failure reported by a [`Transport`] implementation. Opaque to the scan
/// layer: never retried, never interpreted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failure: {detail}")]
    Io { detail: String },
    #[error("tree {tree_id} is not available")]
    TreeUnavailable { tree_id: u64 },
}

/// A TREE_SEARCH-style record source.
///
/// `query` returns `0..=max_items` records with keys in
/// `[min_key, max_key]`, in non-decreasing key order. `max_items` is
/// advisory — a transport may also be byte-budget-limited, so a short batch
/// does not imply exhaustion; only a zero-result call at the advanced
/// cursor does.
pub trait Transport {
    fn query(
        &self,
        tree_id: u64,
        min_key: Key,
        max_key: Key,
        max_items: u64,
    ) -> Result<Vec<RawRecord>, TransportError>;
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Any failure surfaced by a scan. Carries the tree id and key context
/// needed to resume manually from a fresh scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("tree {tree_id}: transport failed at cursor {cursor}: {source}")]
    Transport {
        tree_id: u64,
        cursor: Key,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("tree {tree_id}: protocol violation at {key}: {detail}")]
    Protocol {
        tree_id: u64,
        key: Key,
        detail: &'static str,
    },
    #[error("tree {tree_id}: no item in [{min_key}, {max_key}]")]
    ItemNotFound {
        tree_id: u64,
        min_key: Key,
        max_key: Key,
    },
}

// ── RangeScanner ────────────────────────────────────────────────────────────

enum ScanState {
    Fetching,
    Draining(std::vec::IntoIter<RawRecord>),
    Exhausted,
}

/// A capped, ordered, resumable scan over one key window of one tree.
///
/// Yields every record in `[min_key, max_key]` exactly once, in
/// non-decreasing key order, across however many transport batches that
/// takes. The cursor advances to the last returned key + 1 between batches;
/// a record at the maximum key value ends the scan instead of wrapping the
/// cursor back into already-scanned space.
///
/// Any error ends the scan: after yielding `Err`, the iterator is fused to
/// `None`. Dropping the scanner mid-stream releases nothing more than the
/// current batch.
pub struct RangeScanner<'a, T: Transport + ?Sized> {
    transport: &'a T,
    tree_id: u64,
    max_key: Key,
    cursor: Key,
    budget: u64,
    state: ScanState,
}

impl<'a, T: Transport + ?Sized> RangeScanner<'a, T> {
    /// Begin a scan of `[min_key, max_key]` in `tree_id`, returning at most
    /// `max_total_items` records.
    pub fn start(
        transport: &'a T,
        tree_id: u64,
        min_key: Key,
        max_key: Key,
        max_total_items: u64,
    ) -> Self {
        Self {
            transport,
            tree_id,
            max_key,
            cursor: min_key,
            budget: max_total_items,
            state: ScanState::Fetching,
        }
    }

    #[must_use]
    pub fn tree_id(&self) -> u64 {
        self.tree_id
    }

    /// The key the next fetch would start from. After an error, this is
    /// where a replacement scan should resume.
    #[must_use]
    pub fn cursor(&self) -> Key {
        self.cursor
    }

    /// Wrap this scanner into a decoded-item stream.
    #[must_use]
    pub fn decoded(self) -> Items<'a, T> {
        Items { inner: self }
    }

    fn fetch(&mut self) -> Option<ScanError> {
        trace!(
            tree_id = self.tree_id,
            cursor = %self.cursor,
            budget = self.budget,
            "fetching batch"
        );
        match self
            .transport
            .query(self.tree_id, self.cursor, self.max_key, self.budget)
        {
            Ok(batch) if batch.is_empty() => {
                debug!(tree_id = self.tree_id, cursor = %self.cursor, "scan exhausted");
                self.state = ScanState::Exhausted;
                None
            }
            Ok(batch) => {
                debug!(
                    tree_id = self.tree_id,
                    cursor = %self.cursor,
                    records = batch.len(),
                    "batch fetched"
                );
                self.state = ScanState::Draining(batch.into_iter());
                None
            }
            Err(source) => {
                let err = ScanError::Transport {
                    tree_id: self.tree_id,
                    cursor: self.cursor,
                    source,
                };
                self.state = ScanState::Exhausted;
                Some(err)
            }
        }
    }
}

impl<T: Transport + ?Sized> Iterator for RangeScanner<'_, T> {
    type Item = Result<RawRecord, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                ScanState::Exhausted => return None,
                ScanState::Fetching => {
                    if self.budget == 0 || self.cursor > self.max_key {
                        self.state = ScanState::Exhausted;
                        return None;
                    }
                    if let Some(err) = self.fetch() {
                        return Some(Err(err));
                    }
                }
                ScanState::Draining(batch) => match batch.next() {
                    None => self.state = ScanState::Fetching,
                    Some(record) => {
                        if self.budget == 0 {
                            // Transport over-delivered past the advisory
                            // cap; the cap still binds.
                            self.state = ScanState::Exhausted;
                            return None;
                        }
                        if record.key < self.cursor || record.key > self.max_key {
                            let err = ScanError::Protocol {
                                tree_id: self.tree_id,
                                key: record.key,
                                detail: "record key outside the requested window",
                            };
                            self.state = ScanState::Exhausted;
                            return Some(Err(err));
                        }
                        if record.key == Key::MAX {
                            // Nothing can sort after the maximum key, and
                            // advancing would wrap into scanned space.
                            self.state = ScanState::Exhausted;
                        } else {
                            self.cursor = record.key.wrapping_add(1);
                        }
                        self.budget -= 1;
                        return Some(Ok(record));
                    }
                },
            }
        }
    }
}

// ── Decoded stream ──────────────────────────────────────────────────────────

/// One decoded record: its search key, commit transid, and typed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub transid: u64,
    pub item: Item,
}

/// A [`RangeScanner`] with each raw record piped through
/// [`btq_record::decode`].
pub struct Items<'a, T: Transport + ?Sized> {
    inner: RangeScanner<'a, T>,
}

impl<T: Transport + ?Sized> Items<'_, T> {
    #[must_use]
    pub fn tree_id(&self) -> u64 {
        self.inner.tree_id()
    }
}

impl<T: Transport + ?Sized> Iterator for Items<'_, T> {
    type Item = Result<Record, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.inner.next()? {
            Ok(raw) => raw,
            Err(err) => return Some(Err(err)),
        };
        Some(decode(&raw).map_err(ScanError::from).map(|item| Record {
            key: raw.key,
            transid: raw.transid,
            item,
        }))
    }
}

// ── Extent aggregation ──────────────────────────────────────────────────────

/// One fully assembled extent-tree object: the primary item plus every
/// separately-keyed backref satellite that followed it in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentInfo {
    Extent(ExtentItem),
    Metadata(MetadataItem),
}

impl ExtentInfo {
    #[must_use]
    pub fn vaddr(&self) -> u64 {
        match self {
            ExtentInfo::Extent(e) => e.vaddr,
            ExtentInfo::Metadata(m) => m.vaddr,
        }
    }
}

/// Groups EXTENT_ITEM / METADATA_ITEM primaries with their backref
/// satellites. A group is emitted when the next primary begins or the
/// stream ends. Non-extent kinds interleaved in the extent tree (block
/// group items) are skipped; a satellite with no in-flight primary is a
/// protocol violation, since the assembled object would silently be
/// missing references.
pub struct ExtentIter<'a, T: Transport + ?Sized> {
    items: Items<'a, T>,
    tree_id: u64,
    pending: Option<ExtentInfo>,
    failed: bool,
}

enum Satellite {
    TreeBlock(btq_record::TreeBlockRef),
    SharedBlock(btq_record::SharedBlockRef),
    ExtentData(btq_record::ExtentDataRef),
    SharedData(btq_record::SharedDataRef),
}

impl<T: Transport + ?Sized> ExtentIter<'_, T> {
    fn attach(&mut self, key: Key, satellite: Satellite) -> Result<(), ScanError> {
        let tree_id = self.tree_id;
        let violation = move |detail: &'static str| ScanError::Protocol { tree_id, key, detail };
        let pending = match self.pending.as_mut() {
            Some(p) if p.vaddr() == key.objectid => p,
            _ => return Err(violation("backref satellite with no preceding primary")),
        };
        match (pending, satellite) {
            (ExtentInfo::Extent(e), Satellite::TreeBlock(r)) => match e.tree_block_info.as_mut() {
                Some(info) => info.tree_block_refs.push(r),
                None => return Err(violation("tree block backref on a data extent")),
            },
            (ExtentInfo::Extent(e), Satellite::SharedBlock(r)) => match e.tree_block_info.as_mut()
            {
                Some(info) => info.shared_block_refs.push(r),
                None => return Err(violation("shared block backref on a data extent")),
            },
            (ExtentInfo::Extent(e), Satellite::ExtentData(r)) => e.extent_data_refs.push(r),
            (ExtentInfo::Extent(e), Satellite::SharedData(r)) => e.shared_data_refs.push(r),
            (ExtentInfo::Metadata(m), Satellite::TreeBlock(r)) => m.tree_block_refs.push(r),
            (ExtentInfo::Metadata(m), Satellite::SharedBlock(r)) => m.shared_block_refs.push(r),
            (ExtentInfo::Metadata(_), _) => {
                return Err(violation("data backref on a metadata extent"))
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Iterator for ExtentIter<'_, T> {
    type Item = Result<ExtentInfo, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let record = match self.items.next() {
                None => return self.pending.take().map(Ok),
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            match record.item {
                Item::ExtentItem(e) => {
                    let done = self.pending.replace(ExtentInfo::Extent(e));
                    if done.is_some() {
                        return done.map(Ok);
                    }
                }
                Item::MetadataItem(m) => {
                    let done = self.pending.replace(ExtentInfo::Metadata(m));
                    if done.is_some() {
                        return done.map(Ok);
                    }
                }
                Item::TreeBlockRef(r) => {
                    if let Err(err) = self.attach(record.key, Satellite::TreeBlock(r)) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
                Item::SharedBlockRef(r) => {
                    if let Err(err) = self.attach(record.key, Satellite::SharedBlock(r)) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
                Item::ExtentDataRef(r) => {
                    if let Err(err) = self.attach(record.key, Satellite::ExtentData(r)) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
                Item::SharedDataRef(r) => {
                    if let Err(err) = self.attach(record.key, Satellite::SharedData(r)) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
                // Block group items and anything else sharing the extent
                // tree are not extent objects.
                _ => {}
            }
        }
    }
}

// ── Subvolume dedup ─────────────────────────────────────────────────────────

/// One subvolume: its tree objectid and the latest ROOT_ITEM version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subvolume {
    pub id: u64,
    pub root: RootItem,
}

/// Deduplicates multi-version ROOT_ITEM streams: the root tree may hold
/// several versions of one subvolume root under the same objectid, and the
/// highest-keyed (latest) one is authoritative. Emitted on identity change
/// and at stream end.
pub struct SubvolumeIter<'a, T: Transport + ?Sized> {
    items: Items<'a, T>,
    pending: Option<Subvolume>,
    failed: bool,
}

impl<T: Transport + ?Sized> Iterator for SubvolumeIter<'_, T> {
    type Item = Result<Subvolume, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let record = match self.items.next() {
                None => return self.pending.take().map(Ok),
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            let Item::RootItem(root) = record.item else {
                continue;
            };
            let version = Subvolume {
                id: record.key.objectid,
                root,
            };
            match &self.pending {
                // Later version of the same subvolume wins.
                Some(p) if p.id == version.id => self.pending = Some(version),
                _ => {
                    let done = self.pending.replace(version);
                    if done.is_some() {
                        return done.map(Ok);
                    }
                }
            }
        }
    }
}

// ── Free space stream ───────────────────────────────────────────────────────

/// Streams the free space tree as plain extents, expanding bitmap items
/// in place at the filesystem's sector size. FREE_SPACE_INFO accounting
/// entries are skipped.
pub struct FreeSpaceIter<'a, T: Transport + ?Sized> {
    items: Items<'a, T>,
    sectorsize: u32,
    expanded: std::vec::IntoIter<FreeSpaceExtent>,
    failed: bool,
}

impl<T: Transport + ?Sized> Iterator for FreeSpaceIter<'_, T> {
    type Item = Result<FreeSpaceExtent, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(extent) = self.expanded.next() {
                return Some(Ok(extent));
            }
            let record = match self.items.next()? {
                Ok(record) => record,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            match record.item {
                Item::FreeSpaceExtent(extent) => return Some(Ok(extent)),
                Item::FreeSpaceBitmap(bitmap) => match bitmap.unpack(self.sectorsize) {
                    Ok(extents) => self.expanded = extents.into_iter(),
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err.into()));
                    }
                },
                _ => {}
            }
        }
    }
}

// ── TreeSearch client ───────────────────────────────────────────────────────

/// Per-object-family convenience entry points over one transport.
///
/// Each method fixes the tree id and key window that family lives under
/// and filters the decoded stream down to it. All scans are unbudgeted
/// (the window itself is the cap).
pub struct TreeSearch<T> {
    transport: T,
}

impl<T: Transport> TreeSearch<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Raw scan of `[min_key, max_key]` in `tree_id`.
    pub fn scan(&self, tree_id: u64, min_key: Key, max_key: Key) -> RangeScanner<'_, T> {
        RangeScanner::start(&self.transport, tree_id, min_key, max_key, u64::MAX)
    }

    /// Raw scan returning at most `max_total_items` records.
    pub fn scan_capped(
        &self,
        tree_id: u64,
        min_key: Key,
        max_key: Key,
        max_total_items: u64,
    ) -> RangeScanner<'_, T> {
        RangeScanner::start(&self.transport, tree_id, min_key, max_key, max_total_items)
    }

    /// Decoded scan of `[min_key, max_key]` in `tree_id`.
    pub fn items(&self, tree_id: u64, min_key: Key, max_key: Key) -> Items<'_, T> {
        self.scan(tree_id, min_key, max_key).decoded()
    }

    /// The single item at exactly `key`, or `ItemNotFound`.
    pub fn item_at(&self, tree_id: u64, key: Key) -> Result<Record, ScanError> {
        match self.items(tree_id, key, key).next() {
            Some(result) => result,
            None => Err(ScanError::ItemNotFound {
                tree_id,
                min_key: key,
                max_key: key,
            }),
        }
    }

    /// All devices of the filesystem, from the chunk tree.
    pub fn devices(&self) -> impl Iterator<Item = Result<DevItem, ScanError>> + '_ {
        let min = Key::new(DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, 0);
        let max = Key::new(DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, u64::MAX);
        self.items(CHUNK_TREE_OBJECTID, min, max)
            .filter_map(|result| match result {
                Ok(Record {
                    item: Item::DevItem(dev),
                    ..
                }) => Some(Ok(dev)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
    }

    /// Chunks whose virtual address lies in `[min_vaddr, max_vaddr]`.
    pub fn chunks(
        &self,
        min_vaddr: u64,
        max_vaddr: u64,
    ) -> impl Iterator<Item = Result<Chunk, ScanError>> + '_ {
        let min = Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, min_vaddr);
        let max = Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, max_vaddr);
        self.items(CHUNK_TREE_OBJECTID, min, max)
            .filter_map(|result| match result {
                Ok(Record {
                    item: Item::Chunk(chunk),
                    ..
                }) => Some(Ok(chunk)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
    }

    /// Every device extent, from the dev tree.
    pub fn dev_extents(&self) -> impl Iterator<Item = Result<DevExtent, ScanError>> + '_ {
        self.items(DEV_TREE_OBJECTID, Key::MIN, Key::MAX)
            .filter_map(|result| match result {
                Ok(Record {
                    item: Item::DevExtent(extent),
                    ..
                }) => Some(Ok(extent)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
    }

    /// Every block group, from the extent tree.
    pub fn block_groups(&self) -> impl Iterator<Item = Result<BlockGroupItem, ScanError>> + '_ {
        self.items(EXTENT_TREE_OBJECTID, Key::MIN, Key::MAX)
            .filter_map(|result| match result {
                Ok(Record {
                    item: Item::BlockGroupItem(bg),
                    ..
                }) => Some(Ok(bg)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
    }

    /// The block group at exactly `(vaddr, length)`.
    pub fn block_group(&self, vaddr: u64, length: u64) -> Result<BlockGroupItem, ScanError> {
        let key = Key::new(vaddr, BLOCK_GROUP_ITEM_KEY, length);
        let record = self.item_at(EXTENT_TREE_OBJECTID, key)?;
        match record.item {
            Item::BlockGroupItem(bg) => Ok(bg),
            _ => Err(ScanError::Protocol {
                tree_id: EXTENT_TREE_OBJECTID,
                key,
                detail: "block group key resolved to a different item kind",
            }),
        }
    }

    /// Aggregated extent objects with vaddr in `[min_vaddr, max_vaddr]`.
    ///
    /// `min_vaddr` must be primary-aligned: starting mid-group surfaces the
    /// group's remaining satellites as a protocol error.
    pub fn extents(&self, min_vaddr: u64, max_vaddr: u64) -> ExtentIter<'_, T> {
        let min = Key::new(min_vaddr, 0, 0);
        let max = Key::new(max_vaddr, u8::MAX, u64::MAX);
        ExtentIter {
            items: self.items(EXTENT_TREE_OBJECTID, min, max),
            tree_id: EXTENT_TREE_OBJECTID,
            pending: None,
            failed: false,
        }
    }

    /// Deduplicated subvolumes, latest root item version per objectid.
    pub fn subvolumes(&self) -> SubvolumeIter<'_, T> {
        let min = Key::new(FIRST_FREE_OBJECTID, ROOT_ITEM_KEY, 0);
        let max = Key::new(LAST_FREE_OBJECTID, ROOT_ITEM_KEY, u64::MAX);
        SubvolumeIter {
            items: self.items(ROOT_TREE_OBJECTID, min, max),
            pending: None,
            failed: false,
        }
    }

    /// The free space tree as plain extents, bitmaps expanded at
    /// `sectorsize`.
    pub fn free_space_extents(&self, sectorsize: u32) -> FreeSpaceIter<'_, T> {
        FreeSpaceIter {
            items: self.items(FREE_SPACE_TREE_OBJECTID, Key::MIN, Key::MAX),
            sectorsize,
            expanded: Vec::new().into_iter(),
            failed: false,
        }
    }

    /// Ids of subvolumes queued for deletion, from the root tree's orphan
    /// items.
    pub fn orphan_subvol_ids(&self) -> impl Iterator<Item = Result<u64, ScanError>> + '_ {
        let min = Key::new(ORPHAN_OBJECTID, ORPHAN_ITEM_KEY, 0);
        let max = Key::new(ORPHAN_OBJECTID, ORPHAN_ITEM_KEY, u64::MAX);
        self.items(ROOT_TREE_OBJECTID, min, max)
            .filter_map(|result| match result {
                Ok(Record {
                    key,
                    item: Item::OrphanItem,
                    ..
                }) => Some(Ok(key.offset)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
    }
}

//! End-to-end scans against an in-memory transport.

use std::cell::Cell;
use std::collections::BTreeMap;

use btq_key::{
    Key, BLOCK_GROUP_ITEM_KEY, CHUNK_ITEM_KEY, CHUNK_TREE_OBJECTID, DEV_ITEMS_OBJECTID,
    DEV_ITEM_KEY, EXTENT_DATA_REF_KEY, EXTENT_ITEM_KEY, EXTENT_TREE_OBJECTID,
    FIRST_CHUNK_TREE_OBJECTID, FREE_SPACE_BITMAP_KEY, FREE_SPACE_EXTENT_KEY, FREE_SPACE_INFO_KEY,
    FREE_SPACE_TREE_OBJECTID, METADATA_ITEM_KEY, ORPHAN_ITEM_KEY, ORPHAN_OBJECTID, ROOT_ITEM_KEY,
    ROOT_REF_KEY, ROOT_TREE_OBJECTID, SHARED_DATA_REF_KEY, TREE_BLOCK_REF_KEY,
};
use btq_record::{
    RawRecord, BLOCK_GROUP_DATA, BLOCK_GROUP_METADATA, EXTENT_FLAG_DATA, EXTENT_FLAG_TREE_BLOCK,
};
use btq_scan::{
    ExtentInfo, RangeScanner, ScanError, Transport, TransportError, TreeSearch,
};

/// Deterministic transport over per-tree sorted record lists, with a
/// configurable batch size and optional injected failure.
struct VecTransport {
    trees: BTreeMap<u64, Vec<RawRecord>>,
    batch: usize,
    queries: Cell<usize>,
    fail_on_query: Option<usize>,
}

impl VecTransport {
    fn new(batch: usize) -> Self {
        Self {
            trees: BTreeMap::new(),
            batch,
            queries: Cell::new(0),
            fail_on_query: None,
        }
    }

    fn insert(&mut self, tree_id: u64, key: Key, data: Vec<u8>) {
        let records = self.trees.entry(tree_id).or_default();
        records.push(RawRecord::new(key, 100, data));
        records.sort_by_key(|r| r.key);
    }

    fn queries(&self) -> usize {
        self.queries.get()
    }
}

impl Transport for VecTransport {
    fn query(
        &self,
        tree_id: u64,
        min_key: Key,
        max_key: Key,
        max_items: u64,
    ) -> Result<Vec<RawRecord>, TransportError> {
        let n = self.queries.get() + 1;
        self.queries.set(n);
        if self.fail_on_query == Some(n) {
            return Err(TransportError::Io {
                detail: "injected fault".to_owned(),
            });
        }
        let cap = usize::try_from(max_items)
            .unwrap_or(usize::MAX)
            .min(self.batch);
        Ok(self
            .trees
            .get(&tree_id)
            .map_or(&[][..], Vec::as_slice)
            .iter()
            .filter(|r| r.key >= min_key && r.key <= max_key)
            .take(cap)
            .cloned()
            .collect())
    }
}

/// A transport that ignores the requested window entirely.
struct RogueTransport;

impl Transport for RogueTransport {
    fn query(
        &self,
        _tree_id: u64,
        _min_key: Key,
        _max_key: Key,
        _max_items: u64,
    ) -> Result<Vec<RawRecord>, TransportError> {
        Ok(vec![RawRecord::new(Key::new(0, 0, 5), 1, Vec::new())])
    }
}

// ── payload builders ────────────────────────────────────────────────────────

fn dev_item_payload(devid: u64, total: u64, used: u64) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&devid.to_le_bytes());
    data.extend_from_slice(&total.to_le_bytes());
    data.extend_from_slice(&used.to_le_bytes());
    for _ in 0..3 {
        data.extend_from_slice(&4096_u32.to_le_bytes());
    }
    data.extend_from_slice(&0_u64.to_le_bytes()); // type
    data.extend_from_slice(&1_u64.to_le_bytes()); // generation
    data.extend_from_slice(&0_u64.to_le_bytes()); // start_offset
    data.extend_from_slice(&0_u32.to_le_bytes()); // dev_group
    data.push(0);
    data.push(0);
    data.extend_from_slice(&[0_u8; 16]); // uuid
    data.extend_from_slice(&[0_u8; 16]); // fsid
    data
}

fn chunk_payload(length: u64, chunk_type: u64, stripes: &[(u64, u64)]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&length.to_le_bytes());
    data.extend_from_slice(&EXTENT_TREE_OBJECTID.to_le_bytes()); // owner
    data.extend_from_slice(&65536_u64.to_le_bytes());
    data.extend_from_slice(&chunk_type.to_le_bytes());
    for _ in 0..3 {
        data.extend_from_slice(&4096_u32.to_le_bytes());
    }
    data.extend_from_slice(&u16::try_from(stripes.len()).unwrap().to_le_bytes());
    data.extend_from_slice(&0_u16.to_le_bytes());
    for (devid, offset) in stripes {
        data.extend_from_slice(&devid.to_le_bytes());
        data.extend_from_slice(&offset.to_le_bytes());
        data.extend_from_slice(&[0_u8; 16]);
    }
    data
}

fn extent_payload(refs: u64, generation: u64, flags: u64) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&refs.to_le_bytes());
    data.extend_from_slice(&generation.to_le_bytes());
    data.extend_from_slice(&flags.to_le_bytes());
    data
}

fn extent_data_ref_payload(root: u64, objectid: u64, offset: u64, count: u32) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&root.to_le_bytes());
    data.extend_from_slice(&objectid.to_le_bytes());
    data.extend_from_slice(&offset.to_le_bytes());
    data.extend_from_slice(&count.to_le_bytes());
    data
}

fn block_group_payload(used: u64, flags: u64) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&used.to_le_bytes());
    data.extend_from_slice(&FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
    data.extend_from_slice(&flags.to_le_bytes());
    data
}

fn root_item_payload(generation: u64) -> Vec<u8> {
    let mut data = vec![0_u8; 239];
    data[160..168].copy_from_slice(&generation.to_le_bytes());
    data
}

// ── RangeScanner ────────────────────────────────────────────────────────────

fn raw_tree(n: u64) -> VecTransport {
    let mut transport = VecTransport::new(usize::MAX);
    for i in 0..n {
        transport.insert(7, Key::new(i, 10, i * 2), vec![0xAB]);
    }
    transport
}

#[test]
fn scan_yields_every_record_once_for_any_batch_size() {
    let expected: Vec<Key> = (0..10).map(|i| Key::new(i, 10, i * 2)).collect();
    for batch in [1, 3, 10, 100] {
        let mut transport = raw_tree(10);
        transport.batch = batch;
        let keys: Vec<Key> = RangeScanner::start(&transport, 7, Key::MIN, Key::MAX, u64::MAX)
            .map(|r| r.expect("scan").key)
            .collect();
        assert_eq!(keys, expected, "batch size {batch}");
    }
}

#[test]
fn scan_respects_the_key_window() {
    let transport = raw_tree(10);
    let min = Key::new(3, 0, 0);
    let max = Key::new(6, u8::MAX, u64::MAX);
    let keys: Vec<u64> = RangeScanner::start(&transport, 7, min, max, u64::MAX)
        .map(|r| r.expect("scan").key.objectid)
        .collect();
    assert_eq!(keys, vec![3, 4, 5, 6]);
}

#[test]
fn scan_budget_caps_returned_records() {
    let transport = raw_tree(10);
    let keys: Vec<u64> = RangeScanner::start(&transport, 7, Key::MIN, Key::MAX, 4)
        .map(|r| r.expect("scan").key.objectid)
        .collect();
    assert_eq!(keys, vec![0, 1, 2, 3]);
}

#[test]
fn scan_of_missing_tree_is_empty() {
    let transport = raw_tree(10);
    let mut scan = RangeScanner::start(&transport, 99, Key::MIN, Key::MAX, u64::MAX);
    assert!(scan.next().is_none());
}

#[test]
fn transport_failure_poisons_the_scan() {
    let mut transport = raw_tree(10);
    transport.batch = 3;
    transport.fail_on_query = Some(2);
    let mut scan = RangeScanner::start(&transport, 7, Key::MIN, Key::MAX, u64::MAX);

    for expected in 0..3 {
        let record = scan.next().expect("first batch").expect("first batch");
        assert_eq!(record.key.objectid, expected);
    }
    let err = scan.next().expect("failure surfaces").unwrap_err();
    // Cursor is the last yielded key (2, 10, 4) plus one.
    assert!(
        matches!(
            &err,
            ScanError::Transport { tree_id: 7, cursor, .. } if *cursor == Key::new(2, 10, 5)
        ),
        "{err:?}"
    );
    // Poisoned: no resumption on the same instance.
    assert!(scan.next().is_none());
    assert_eq!(transport.queries(), 2);
}

#[test]
fn record_at_maximum_key_ends_the_scan() {
    let mut transport = VecTransport::new(usize::MAX);
    transport.insert(7, Key::new(5, 10, 0), Vec::new());
    transport.insert(7, Key::MAX, Vec::new());
    let mut scan = RangeScanner::start(&transport, 7, Key::MIN, Key::MAX, u64::MAX);

    assert_eq!(scan.next().expect("first").expect("first").key.objectid, 5);
    assert_eq!(scan.next().expect("second").expect("second").key, Key::MAX);
    assert!(scan.next().is_none());
    // The cursor never wrapped back to MIN for another fetch.
    assert_eq!(transport.queries(), 1);
}

#[test]
fn out_of_window_record_is_a_protocol_error() {
    let min = Key::new(10, 0, 0);
    let mut scan = RangeScanner::start(&RogueTransport, 7, min, Key::MAX, u64::MAX);
    let err = scan.next().expect("violation surfaces").unwrap_err();
    assert!(
        matches!(&err, ScanError::Protocol { tree_id: 7, key, .. } if key.offset == 5),
        "{err:?}"
    );
    assert!(scan.next().is_none());
}

// ── TreeSearch object families ──────────────────────────────────────────────

fn chunk_tree_fixture() -> VecTransport {
    let mut transport = VecTransport::new(2);
    transport.insert(
        CHUNK_TREE_OBJECTID,
        Key::new(DEV_ITEMS_OBJECTID, DEV_ITEM_KEY, 1),
        dev_item_payload(1, 100 << 30, 10 << 30),
    );
    transport.insert(
        CHUNK_TREE_OBJECTID,
        Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, 0x40_0000),
        chunk_payload(1 << 30, BLOCK_GROUP_DATA, &[(1, 0x10_0000)]),
    );
    transport.insert(
        CHUNK_TREE_OBJECTID,
        Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, 0x4040_0000),
        chunk_payload(1 << 30, BLOCK_GROUP_METADATA, &[(1, 0x4010_0000)]),
    );
    transport
}

#[test]
fn devices_and_chunks_from_the_chunk_tree() {
    let search = TreeSearch::new(chunk_tree_fixture());

    let devices: Vec<_> = search
        .devices()
        .collect::<Result<_, _>>()
        .expect("devices");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].devid, 1);
    assert_eq!(devices[0].total_bytes, 100 << 30);

    let chunks: Vec<_> = search
        .chunks(0, u64::MAX)
        .collect::<Result<_, _>>()
        .expect("chunks");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].vaddr, 0x40_0000);
    assert_eq!(chunks[1].vaddr, 0x4040_0000);
    assert_eq!(chunks[1].chunk_type, BLOCK_GROUP_METADATA);

    // Sub-range selects one chunk.
    let chunks: Vec<_> = search
        .chunks(0x4000_0000, u64::MAX)
        .collect::<Result<_, _>>()
        .expect("chunks");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].vaddr, 0x4040_0000);
}

#[test]
fn extent_grouping_attaches_satellites_to_their_primary() {
    let mut transport = VecTransport::new(2);
    let tree = EXTENT_TREE_OBJECTID;
    // Data extent A with two separately-keyed backrefs.
    transport.insert(
        tree,
        Key::new(0x1000, EXTENT_ITEM_KEY, 0x1000),
        extent_payload(3, 7, EXTENT_FLAG_DATA),
    );
    transport.insert(
        tree,
        Key::new(0x1000, EXTENT_DATA_REF_KEY, 0xBEEF),
        extent_data_ref_payload(5, 257, 0, 2),
    );
    transport.insert(
        tree,
        Key::new(0x1000, SHARED_DATA_REF_KEY, 0x9000),
        1_u32.to_le_bytes().to_vec(),
    );
    // A block group item interleaved between groups is not an extent.
    transport.insert(
        tree,
        Key::new(0x1800, BLOCK_GROUP_ITEM_KEY, 0x800),
        block_group_payload(0x400, BLOCK_GROUP_DATA),
    );
    // Skinny metadata extent B with one tree block backref.
    transport.insert(
        tree,
        Key::new(0x2000, METADATA_ITEM_KEY, 0),
        extent_payload(1, 9, EXTENT_FLAG_TREE_BLOCK),
    );
    transport.insert(tree, Key::new(0x2000, TREE_BLOCK_REF_KEY, 5), Vec::new());

    let search = TreeSearch::new(transport);
    let groups: Vec<_> = search
        .extents(0, u64::MAX)
        .collect::<Result<_, _>>()
        .expect("extents");
    assert_eq!(groups.len(), 2);

    let ExtentInfo::Extent(a) = &groups[0] else {
        panic!("first group should be a data extent");
    };
    assert_eq!(a.vaddr, 0x1000);
    assert_eq!(a.extent_data_refs.len(), 1);
    assert_eq!(a.extent_data_refs[0].objectid, 257);
    assert_eq!(a.shared_data_refs.len(), 1);
    assert_eq!(a.shared_data_refs[0].parent, 0x9000);

    let ExtentInfo::Metadata(b) = &groups[1] else {
        panic!("second group should be a metadata extent");
    };
    assert_eq!(b.vaddr, 0x2000);
    assert_eq!(b.tree_block_refs.len(), 1);
    assert_eq!(b.tree_block_refs[0].root, 5);
}

#[test]
fn primary_without_satellites_is_a_group_of_its_own() {
    let mut transport = VecTransport::new(usize::MAX);
    transport.insert(
        EXTENT_TREE_OBJECTID,
        Key::new(0x1000, EXTENT_ITEM_KEY, 0x1000),
        extent_payload(1, 7, EXTENT_FLAG_DATA),
    );
    let search = TreeSearch::new(transport);
    let groups: Vec<_> = search
        .extents(0, u64::MAX)
        .collect::<Result<_, _>>()
        .expect("extents");
    assert_eq!(groups.len(), 1);
    assert!(matches!(&groups[0], ExtentInfo::Extent(e) if e.extent_data_refs.is_empty()));
}

#[test]
fn satellite_without_primary_is_a_protocol_error() {
    let mut transport = VecTransport::new(usize::MAX);
    transport.insert(
        EXTENT_TREE_OBJECTID,
        Key::new(0x1000, EXTENT_DATA_REF_KEY, 0xBEEF),
        extent_data_ref_payload(5, 257, 0, 1),
    );
    let search = TreeSearch::new(transport);
    let mut extents = search.extents(0, u64::MAX);
    let err = extents.next().expect("violation surfaces").unwrap_err();
    assert!(
        matches!(&err, ScanError::Protocol { key, .. } if key.objectid == 0x1000),
        "{err:?}"
    );
    assert!(extents.next().is_none());
}

#[test]
fn subvolume_dedup_keeps_the_last_version() {
    let mut transport = VecTransport::new(2);
    let tree = ROOT_TREE_OBJECTID;
    transport.insert(tree, Key::new(256, ROOT_ITEM_KEY, 10), root_item_payload(1));
    transport.insert(tree, Key::new(256, ROOT_ITEM_KEY, 20), root_item_payload(2));
    // A root ref in the window is not a subvolume root.
    transport.insert(tree, Key::new(256, ROOT_REF_KEY, 257), {
        let mut d = Vec::new();
        d.extend_from_slice(&256_u64.to_le_bytes());
        d.extend_from_slice(&2_u64.to_le_bytes());
        d.extend_from_slice(&3_u16.to_le_bytes());
        d.extend_from_slice(b"sub");
        d
    });
    transport.insert(tree, Key::new(257, ROOT_ITEM_KEY, 0), root_item_payload(1));

    let search = TreeSearch::new(transport);
    let subvols: Vec<_> = search
        .subvolumes()
        .collect::<Result<_, _>>()
        .expect("subvolumes");
    assert_eq!(subvols.len(), 2);
    assert_eq!(subvols[0].id, 256);
    assert_eq!(subvols[0].root.generation, 2, "later version wins");
    assert_eq!(subvols[1].id, 257);
    assert_eq!(subvols[1].root.generation, 1);
}

#[test]
fn free_space_stream_expands_bitmaps_in_place() {
    let mut transport = VecTransport::new(2);
    let tree = FREE_SPACE_TREE_OBJECTID;
    transport.insert(tree, Key::new(0x40_0000, FREE_SPACE_INFO_KEY, 0x10_0000), {
        let mut d = Vec::new();
        d.extend_from_slice(&2_u32.to_le_bytes());
        d.extend_from_slice(&0_u32.to_le_bytes());
        d
    });
    transport.insert(
        tree,
        Key::new(0x41_0000, FREE_SPACE_EXTENT_KEY, 0x2000),
        Vec::new(),
    );
    // Bits 1 and 2 set: one run of two sectors starting one sector in.
    transport.insert(
        tree,
        Key::new(0x42_0000, FREE_SPACE_BITMAP_KEY, 8 * 4096),
        vec![0b0000_0110],
    );
    transport.insert(
        tree,
        Key::new(0x44_0000, FREE_SPACE_EXTENT_KEY, 0x1000),
        Vec::new(),
    );

    let search = TreeSearch::new(transport);
    let extents: Vec<(u64, u64)> = search
        .free_space_extents(4096)
        .map(|r| r.map(|e| (e.vaddr, e.length)))
        .collect::<Result<_, _>>()
        .expect("free space");
    assert_eq!(
        extents,
        vec![
            (0x41_0000, 0x2000),
            (0x42_0000 + 4096, 2 * 4096),
            (0x44_0000, 0x1000),
        ]
    );
}

#[test]
fn block_group_lookup() {
    let mut transport = VecTransport::new(usize::MAX);
    transport.insert(
        EXTENT_TREE_OBJECTID,
        Key::new(0x40_0000, BLOCK_GROUP_ITEM_KEY, 0x10_0000),
        block_group_payload(0x8_0000, BLOCK_GROUP_DATA),
    );
    let search = TreeSearch::new(transport);

    let bg = search.block_group(0x40_0000, 0x10_0000).expect("present");
    assert_eq!(bg.used, 0x8_0000);
    assert_eq!(bg.flags, BLOCK_GROUP_DATA);

    let err = search.block_group(0x50_0000, 0x10_0000).unwrap_err();
    assert!(matches!(err, ScanError::ItemNotFound { .. }), "{err:?}");
}

#[test]
fn orphan_subvol_ids_come_from_key_offsets() {
    let mut transport = VecTransport::new(1);
    transport.insert(
        ROOT_TREE_OBJECTID,
        Key::new(ORPHAN_OBJECTID, ORPHAN_ITEM_KEY, 290),
        Vec::new(),
    );
    transport.insert(
        ROOT_TREE_OBJECTID,
        Key::new(ORPHAN_OBJECTID, ORPHAN_ITEM_KEY, 291),
        Vec::new(),
    );
    let search = TreeSearch::new(transport);
    let ids: Vec<u64> = search
        .orphan_subvol_ids()
        .collect::<Result<_, _>>()
        .expect("orphans");
    assert_eq!(ids, vec![290, 291]);
}

#[test]
fn malformed_record_fails_the_decoded_stream() {
    let mut transport = VecTransport::new(usize::MAX);
    // A chunk item with a truncated stripe array.
    transport.insert(
        CHUNK_TREE_OBJECTID,
        Key::new(FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, 0x40_0000),
        chunk_payload(1 << 30, BLOCK_GROUP_DATA, &[(1, 0)])[..60].to_vec(),
    );
    let search = TreeSearch::new(transport);
    let err = search
        .chunks(0, u64::MAX)
        .next()
        .expect("decode failure surfaces")
        .unwrap_err();
    assert!(matches!(err, ScanError::Record(_)), "{err:?}");
}

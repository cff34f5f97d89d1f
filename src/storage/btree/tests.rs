use super::codecs::{compare_u64_key, u64_key};
use super::page::{self, BTREE_ALLOW_GHOSTS, BTREE_HASHED};
use super::tree::find_bin;
use super::{BTree, BTreeOptions, Entry, FindMode};
use crate::primitives::io::MemBlockSource;
use crate::testkit::{BuiltTree, ImageBuilder, MapTable, Record, TreeShape, TEST_BLOCK_SIZE};
use crate::types::{ApfsError, Oid, Result, Xid};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

const MODES: [FindMode; 5] = [
    FindMode::Eq,
    FindMode::Le,
    FindMode::Lt,
    FindMode::Ge,
    FindMode::Gt,
];

fn key_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(arr)
}

fn entry_pair(entry: &Entry) -> (u64, Vec<u8>) {
    (key_u64(entry.key()), entry.val().to_vec())
}

fn open_physical(image: &ImageBuilder, built: &BuiltTree, options: BTreeOptions) -> Result<BTree> {
    BTree::open(image.source(), built.root, built.xid, None, options)
}

fn build_u64_tree(
    keys: impl IntoIterator<Item = u64>,
    shape: &TreeShape,
) -> Result<(ImageBuilder, BuiltTree)> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let records = keys
        .into_iter()
        .map(|k| Record::u64(k, (k as u32).to_le_bytes().to_vec()))
        .collect();
    let built = image.tree(shape, records)?;
    Ok((image, built))
}

/// Two leaves split at key 100: [0, 100) and [100, 200).
fn split_at_100() -> Result<(ImageBuilder, BuiltTree)> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let leaf = |range: std::ops::Range<u64>| {
        range
            .map(|k| Record::u64(k, (k as u32).to_le_bytes().to_vec()))
            .collect::<Vec<_>>()
    };
    let built = image.tree_from_leaves(&TreeShape::fixed(8, 4), vec![leaf(0..100), leaf(100..200)])?;
    Ok((image, built))
}

fn reference_find(map: &BTreeMap<u64, u32>, key: u64, mode: FindMode) -> Option<u64> {
    let found = match mode {
        FindMode::Eq => map.get_key_value(&key),
        FindMode::Le => map.range(..=key).next_back(),
        FindMode::Lt => map.range(..key).next_back(),
        FindMode::Ge => map.range(key..).next(),
        FindMode::Gt => map
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next(),
    };
    found.map(|(k, _)| *k)
}

fn collect_keys(tree: &BTree) -> Result<Vec<u64>> {
    tree.get_iterator_begin()?
        .map(|entry| entry.map(|e| key_u64(e.key())))
        .collect()
}

#[test]
fn empty_tree_finds_nothing() -> Result<()> {
    let (image, built) = build_u64_tree(std::iter::empty(), &TreeShape::fixed(8, 4))?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    assert_eq!(tree.root().entries_cnt(), 0);
    for mode in MODES {
        assert!(tree.lookup_with(&u64_key(7), &compare_u64_key, mode)?.is_none());
    }
    assert!(tree.get_iterator_begin()?.is_exhausted());
    let mut iter = tree.get_iterator(&u64_key(0), &compare_u64_key)?;
    assert!(iter.entry()?.is_none());
    assert!(!iter.advance()?);
    assert!(iter.next().is_none());
    Ok(())
}

#[test]
fn single_leaf_point_lookups() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let records = vec![
        Record::u64(1, b"a".to_vec()),
        Record::u64(3, b"b".to_vec()),
        Record::u64(5, b"c".to_vec()),
    ];
    let built = image.tree(&TreeShape::variable(), records)?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let cmp = compare_u64_key;

    let hit = tree.lookup(&u64_key(3), &cmp, true)?.expect("exact hit");
    assert_eq!(entry_pair(&hit), (3, b"b".to_vec()));
    assert!(tree.lookup(&u64_key(4), &cmp, true)?.is_none());

    let le = tree.lookup(&u64_key(4), &cmp, false)?.expect("le hit");
    assert_eq!(entry_pair(&le), (3, b"b".to_vec()));
    let ge = tree.lookup_with(&u64_key(4), &cmp, FindMode::Ge)?.expect("ge hit");
    assert_eq!(entry_pair(&ge), (5, b"c".to_vec()));
    let lt = tree.lookup_with(&u64_key(3), &cmp, FindMode::Lt)?.expect("lt hit");
    assert_eq!(key_u64(lt.key()), 1);
    let gt = tree.lookup_with(&u64_key(3), &cmp, FindMode::Gt)?.expect("gt hit");
    assert_eq!(key_u64(gt.key()), 5);

    assert!(tree.lookup_with(&u64_key(5), &cmp, FindMode::Gt)?.is_none());
    assert!(tree.lookup_with(&u64_key(1), &cmp, FindMode::Lt)?.is_none());
    assert!(tree.lookup_with(&u64_key(0), &cmp, FindMode::Le)?.is_none());
    assert!(tree.lookup_with(&u64_key(9), &cmp, FindMode::Ge)?.is_none());

    let vals: Vec<Vec<u8>> = tree
        .get_iterator_begin()?
        .map(|e| e.map(|e| e.val().to_vec()))
        .collect::<Result<_>>()?;
    assert_eq!(vals, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    Ok(())
}

#[test]
fn duplicate_keys_resolve_by_mode() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let records = vec![
        Record::u64(1, b"p".to_vec()),
        Record::u64(2, b"q".to_vec()),
        Record::u64(2, b"r".to_vec()),
        Record::u64(2, b"s".to_vec()),
        Record::u64(3, b"t".to_vec()),
    ];
    let built = image.tree(&TreeShape::variable(), records)?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let root = tree.root();
    let key = u64_key(2);
    assert_eq!(find_bin(root, &key, &compare_u64_key, FindMode::Eq)?, Some(1));
    assert_eq!(find_bin(root, &key, &compare_u64_key, FindMode::Ge)?, Some(1));
    assert_eq!(find_bin(root, &key, &compare_u64_key, FindMode::Lt)?, Some(0));
    assert_eq!(find_bin(root, &key, &compare_u64_key, FindMode::Le)?, Some(3));
    assert_eq!(find_bin(root, &key, &compare_u64_key, FindMode::Gt)?, Some(4));
    Ok(())
}

#[test]
fn lookup_descends_into_covering_leaf() -> Result<()> {
    let (image, built) = split_at_100()?;
    let source: Arc<MemBlockSource> = image.source();
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    assert_eq!(tree.root().level(), 1);
    assert_eq!(tree.root().entries_cnt(), 2);

    let before = source.reads();
    let hit = tree.lookup(&u64_key(150), &compare_u64_key, true)?.expect("key 150");
    assert_eq!(entry_pair(&hit), (150, 150u32.to_le_bytes().to_vec()));
    assert_eq!(hit.node().paddr(), built.leaves[1].1);
    assert_eq!(hit.node().parent_index(), 1);
    assert_eq!(source.reads(), before + 1);

    #[cfg(feature = "node-cache")]
    {
        tree.lookup(&u64_key(151), &compare_u64_key, true)?.expect("key 151");
        assert_eq!(source.reads(), before + 1);
        let stats = tree.stats_snapshot();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.node_decodes, 2);
    }
    Ok(())
}

#[test]
fn nearest_modes_cross_leaf_boundaries() -> Result<()> {
    let (image, built) = split_at_100()?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let cmp = compare_u64_key;

    let lt = tree.lookup_with(&u64_key(100), &cmp, FindMode::Lt)?.expect("lt");
    assert_eq!(key_u64(lt.key()), 99);
    assert_eq!(lt.node().paddr(), built.leaves[0].1);

    let gt = tree.lookup_with(&u64_key(99), &cmp, FindMode::Gt)?.expect("gt");
    assert_eq!(key_u64(gt.key()), 100);
    assert_eq!(gt.node().paddr(), built.leaves[1].1);

    let ge = tree.lookup_with(&u64_key(200), &cmp, FindMode::Ge)?;
    assert!(ge.is_none());
    let le = tree.lookup_with(&u64_key(1_000), &cmp, FindMode::Le)?.expect("le");
    assert_eq!(key_u64(le.key()), 199);
    Ok(())
}

fn tagged_leaf(entries: &[(u64, &str)]) -> Vec<Record> {
    entries
        .iter()
        .map(|(k, tag)| Record::u64(*k, tag.as_bytes().to_vec()))
        .collect()
}

fn tag_of(entry: Option<Entry>) -> Option<String> {
    entry.map(|e| String::from_utf8_lossy(e.val()).into_owned())
}

#[test]
fn equal_keys_spanning_leaves_resolve_by_mode() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let built = image.tree_from_leaves(
        &TreeShape::variable(),
        vec![
            tagged_leaf(&[(1, "a"), (5, "b"), (5, "c")]),
            tagged_leaf(&[(5, "d"), (5, "e"), (7, "f")]),
        ],
    )?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let cmp = compare_u64_key;
    let key = u64_key(5);

    let find = |mode| -> Result<Option<String>> { Ok(tag_of(tree.lookup_with(&key, &cmp, mode)?)) };
    assert_eq!(find(FindMode::Eq)?.as_deref(), Some("b"));
    assert_eq!(find(FindMode::Ge)?.as_deref(), Some("b"));
    assert_eq!(find(FindMode::Lt)?.as_deref(), Some("a"));
    assert_eq!(find(FindMode::Le)?.as_deref(), Some("e"));
    assert_eq!(find(FindMode::Gt)?.as_deref(), Some("f"));

    let tags: Vec<String> = tree
        .get_iterator(&key, &cmp)?
        .map(|e| e.map(|e| String::from_utf8_lossy(e.val()).into_owned()))
        .collect::<Result<_>>()?;
    assert_eq!(tags, vec!["b", "c", "d", "e", "f"]);
    Ok(())
}

#[test]
fn leaf_made_of_equal_keys_is_crossed() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let built = image.tree_from_leaves(
        &TreeShape::variable(),
        vec![
            tagged_leaf(&[(1, "a"), (5, "b")]),
            tagged_leaf(&[(5, "c"), (5, "d")]),
            tagged_leaf(&[(5, "e"), (9, "f")]),
        ],
    )?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let cmp = compare_u64_key;
    let key = u64_key(5);

    assert_eq!(tag_of(tree.lookup(&key, &cmp, true)?).as_deref(), Some("b"));
    assert_eq!(tag_of(tree.lookup_with(&key, &cmp, FindMode::Lt)?).as_deref(), Some("a"));
    assert_eq!(tag_of(tree.lookup(&key, &cmp, false)?).as_deref(), Some("e"));
    let hit = tree.lookup_with(&u64_key(6), &cmp, FindMode::Ge)?.expect("ge 6");
    assert_eq!(entry_pair(&hit), (9, b"f".to_vec()));
    assert_eq!(
        tag_of(tree.lookup_with(&u64_key(4), &cmp, FindMode::Gt)?).as_deref(),
        Some("b")
    );
    assert_eq!(tree.get_iterator(&key, &cmp)?.count(), 5);
    Ok(())
}

#[test]
fn iterator_walks_multi_level_tree_in_order() -> Result<()> {
    let shape = TreeShape::fixed(8, 4).leaf_capacity(7).fanout(3);
    let (image, built) = build_u64_tree((0..1_000u64).map(|k| k * 2), &shape)?;
    assert!(built.height >= 3);
    let tree = open_physical(&image, &built, BTreeOptions::default())?;

    let keys = collect_keys(&tree)?;
    assert_eq!(keys, (0..1_000u64).map(|k| k * 2).collect::<Vec<_>>());

    let mut iter = tree.get_iterator(&u64_key(501), &compare_u64_key)?;
    let first = iter.entry()?.expect("entry at or after 501");
    assert_eq!(key_u64(first.key()), 502);
    let same = iter.entry()?.expect("entry is stable");
    assert!(Arc::ptr_eq(first.node(), same.node()));
    assert_eq!(first.index(), same.index());
    assert!(iter.advance()?);
    assert_eq!(key_u64(iter.entry()?.expect("next").key()), 504);

    let tail: Vec<u64> = tree
        .get_iterator(&u64_key(1_990), &compare_u64_key)?
        .map(|e| e.map(|e| key_u64(e.key())))
        .collect::<Result<_>>()?;
    assert_eq!(tail, vec![1_990, 1_992, 1_994, 1_996, 1_998]);

    assert!(tree
        .get_iterator(&u64_key(5_000), &compare_u64_key)?
        .is_exhausted());
    Ok(())
}

#[test]
fn exhausted_cursor_stays_exhausted() -> Result<()> {
    let (image, built) = split_at_100()?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let mut iter = tree.get_iterator(&u64_key(198), &compare_u64_key)?;
    assert!(iter.advance()?);
    assert!(!iter.advance()?);
    assert!(iter.is_exhausted());
    assert!(iter.entry()?.is_none());
    assert!(!iter.advance()?);

    let leaf = tree
        .lookup(&u64_key(10), &compare_u64_key, true)?
        .expect("key 10")
        .node()
        .clone();
    iter.setup(leaf, 10);
    assert_eq!(key_u64(iter.entry()?.expect("repositioned").key()), 10);
    iter.reset();
    assert!(iter.entry()?.is_none());
    Ok(())
}

#[test]
fn ghost_entries_have_empty_values() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let records = vec![
        Record::u64(1, 11u32.to_le_bytes().to_vec()),
        Record::ghost(2u64.to_le_bytes().to_vec()),
        Record::u64(3, 33u32.to_le_bytes().to_vec()),
    ];
    let shape = TreeShape::fixed(8, 4).flags(BTREE_ALLOW_GHOSTS);
    let built = image.tree(&shape, records)?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    assert!(tree.info().allows_ghosts());

    let ghost = tree.lookup(&u64_key(2), &compare_u64_key, true)?.expect("ghost");
    assert!(ghost.val().is_empty());
    let pairs: Vec<(u64, usize)> = tree
        .get_iterator_begin()?
        .map(|e| e.map(|e| (key_u64(e.key()), e.val().len())))
        .collect::<Result<_>>()?;
    assert_eq!(pairs, vec![(1, 4), (2, 0), (3, 4)]);
    Ok(())
}

#[test]
fn hashed_internal_nodes_read_leading_child_id() -> Result<()> {
    let shape = TreeShape::fixed(8, 4)
        .flags(BTREE_HASHED)
        .leaf_capacity(16)
        .fanout(4);
    let (image, built) = build_u64_tree(0..200u64, &shape)?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    assert!(tree.info().is_hashed());
    assert!(tree.root().header().is_hashed());
    assert_eq!(tree.root().val_at(0)?.len(), page::HASHED_CHILD_LEN);
    for key in [0u64, 77, 199] {
        let hit = tree.lookup(&u64_key(key), &compare_u64_key, true)?.expect("hit");
        assert_eq!(key_u64(hit.key()), key);
    }
    assert_eq!(collect_keys(&tree)?.len(), 200);
    Ok(())
}

#[test]
fn variable_keys_with_custom_comparator() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let mut names: Vec<String> = (0..300).map(|i| format!("file-{i:04}.txt")).collect();
    names.sort();
    let records = names
        .iter()
        .map(|n| Record::new(n.as_bytes().to_vec(), n.len().to_le_bytes().to_vec()))
        .collect();
    let built = image.tree(&TreeShape::variable().leaf_capacity(20).fanout(5), records)?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;

    let bytewise = |search: &[u8], candidate: &[u8]| search.cmp(candidate);
    let hit = tree
        .lookup(b"file-0123.txt", &bytewise, true)?
        .expect("name present");
    assert_eq!(hit.key(), b"file-0123.txt");
    let after = tree
        .lookup_with(b"file-0123.zzz", &bytewise, FindMode::Gt)?
        .expect("successor");
    assert_eq!(after.key(), b"file-0124.txt");
    assert!(tree.lookup(b"missing", &bytewise, true)?.is_none());
    Ok(())
}

#[test]
fn checksum_mismatch_is_reported() -> Result<()> {
    let (image, built) = split_at_100()?;
    let leaf = built.leaves[0].1;
    image.patch_block(leaf, false, |block| block[200] ^= 0xff)?;

    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    match tree.lookup(&u64_key(5), &compare_u64_key, true) {
        Err(ApfsError::Checksum { paddr }) => assert_eq!(paddr, leaf),
        other => panic!("expected checksum error, got {other:?}"),
    }

    let lenient = open_physical(&image, &built, BTreeOptions::default().verify_checksums(false))?;
    assert!(lenient.lookup(&u64_key(150), &compare_u64_key, true)?.is_some());
    Ok(())
}

#[test]
fn corrupt_key_offset_is_rejected() -> Result<()> {
    let (image, built) = split_at_100()?;
    let leaf = built.leaves[1].1;
    image.patch_block(leaf, true, |block| {
        page::write_kvoff(block, page::NODE_HEADER_LEN, 0, 0xfff0, 4);
    })?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let err = tree
        .lookup(&u64_key(100), &compare_u64_key, true)
        .expect_err("key offset past value area");
    assert!(matches!(err, ApfsError::Corruption(_)), "{err:?}");
    Ok(())
}

#[test]
fn corrupt_value_offset_is_rejected() -> Result<()> {
    let (image, built) = split_at_100()?;
    let leaf = built.leaves[0].1;
    image.patch_block(leaf, true, |block| {
        page::write_kvoff(block, page::NODE_HEADER_LEN, 3, 24, 0x7000);
    })?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let err = tree
        .lookup(&u64_key(3), &compare_u64_key, true)
        .expect_err("value offset before block start");
    assert!(matches!(err, ApfsError::Corruption(_)), "{err:?}");
    Ok(())
}

#[test]
fn wrong_object_type_is_rejected_at_open() -> Result<()> {
    let (image, built) = split_at_100()?;
    image.patch_block(built.root_paddr, true, |block| {
        block[24..28].copy_from_slice(&0x0bu32.to_le_bytes());
    })?;
    let err = open_physical(&image, &built, BTreeOptions::default())
        .err()
        .expect("object map is not a btree root");
    assert!(matches!(err, ApfsError::UnexpectedObject { .. }), "{err:?}");
    assert!(open_physical(&image, &built, BTreeOptions::default().check_object_type(false)).is_ok());
    Ok(())
}

#[test]
fn missing_root_mapping_is_not_found() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4).virtual_oids(0x500);
    let built = image.tree(&shape, (0..10u64).map(|k| Record::u64(k, vec![0; 4])).collect())?;
    let mapper = Arc::new(MapTable::new());
    let err = BTree::open(image.source(), built.root, built.xid, Some(mapper), BTreeOptions::default())
        .err()
        .expect("root unmapped");
    assert!(matches!(err, ApfsError::NotFound));
    Ok(())
}

#[test]
fn iteration_skips_unmapped_subtrees() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4)
        .virtual_oids(0x1000)
        .leaf_capacity(10);
    let records = (0..50u64).map(|k| Record::u64(k, vec![1; 4])).collect();
    let built = image.tree(&shape, records)?;
    let mapper = Arc::new(MapTable::from_tree(&built));
    mapper.remove(built.leaves[2].0);

    let tree = BTree::open(
        image.source(),
        built.root,
        built.xid,
        Some(mapper.clone()),
        BTreeOptions::default(),
    )?;
    let keys = collect_keys(&tree)?;
    let expected: Vec<u64> = (0..20u64).chain(30..50).collect();
    assert_eq!(keys, expected);
    assert!(tree.lookup(&u64_key(25), &compare_u64_key, true)?.is_none());
    assert!(tree.stats_snapshot().omap_misses >= 1);
    Ok(())
}

#[test]
fn unmapped_first_subtree_leaves_the_rest_reachable() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4)
        .virtual_oids(0x1800)
        .leaf_capacity(10);
    let records = (0..50u64).map(|k| Record::u64(k, vec![3; 4])).collect();
    let built = image.tree(&shape, records)?;
    let mapper = Arc::new(MapTable::from_tree(&built));
    mapper.remove(built.leaves[0].0);
    let tree = BTree::open(image.source(), built.root, built.xid, Some(mapper), BTreeOptions::default())?;
    let cmp = compare_u64_key;

    assert_eq!(collect_keys(&tree)?, (10..50u64).collect::<Vec<_>>());
    let from_3: Vec<u64> = tree
        .get_iterator(&u64_key(3), &cmp)?
        .map(|e| e.map(|e| key_u64(e.key())))
        .collect::<Result<_>>()?;
    assert_eq!(from_3, (10..50u64).collect::<Vec<_>>());

    let ge = tree.lookup_with(&u64_key(3), &cmp, FindMode::Ge)?.expect("ge 3");
    assert_eq!(key_u64(ge.key()), 10);
    let gt = tree.lookup_with(&u64_key(3), &cmp, FindMode::Gt)?.expect("gt 3");
    assert_eq!(key_u64(gt.key()), 10);
    assert!(tree.lookup(&u64_key(3), &cmp, true)?.is_none());
    assert!(tree.lookup_with(&u64_key(3), &cmp, FindMode::Le)?.is_none());
    assert!(tree.lookup_with(&u64_key(10), &cmp, FindMode::Lt)?.is_none());
    Ok(())
}

#[test]
fn unmapped_middle_subtree_bridges_nearest_matches() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4)
        .virtual_oids(0x1c00)
        .leaf_capacity(10);
    let records = (0..50u64).map(|k| Record::u64(k, vec![4; 4])).collect();
    let built = image.tree(&shape, records)?;
    let mapper = Arc::new(MapTable::from_tree(&built));
    mapper.remove(built.leaves[2].0);
    let tree = BTree::open(image.source(), built.root, built.xid, Some(mapper), BTreeOptions::default())?;
    let cmp = compare_u64_key;

    let le = tree.lookup(&u64_key(25), &cmp, false)?.expect("le 25");
    assert_eq!(key_u64(le.key()), 19);
    let lt = tree.lookup_with(&u64_key(25), &cmp, FindMode::Lt)?.expect("lt 25");
    assert_eq!(key_u64(lt.key()), 19);
    let ge = tree.lookup_with(&u64_key(25), &cmp, FindMode::Ge)?.expect("ge 25");
    assert_eq!(key_u64(ge.key()), 30);
    let first = tree.get_iterator(&u64_key(25), &cmp)?.next().expect("entry")?;
    assert_eq!(key_u64(first.key()), 30);
    Ok(())
}

#[test]
fn virtual_tree_respects_read_transaction() -> Result<()> {
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4).virtual_oids(0x2000).xid(Xid(10));
    let built = image.tree(&shape, (0..5u64).map(|k| Record::u64(k, vec![2; 4])).collect())?;
    let mapper = Arc::new(MapTable::from_tree(&built));

    let early = BTree::open(image.source(), built.root, Xid(9), Some(mapper.clone()), BTreeOptions::default());
    assert!(matches!(early.err(), Some(ApfsError::NotFound)));
    let tree = BTree::open(image.source(), built.root, Xid(12), Some(mapper), BTreeOptions::default())?;
    assert_eq!(tree.xid(), Xid(12));
    assert_eq!(tree.root_oid(), Oid(0x2000));
    assert_eq!(collect_keys(&tree)?, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[cfg(feature = "node-cache")]
#[test]
fn cache_respects_capacity() -> Result<()> {
    let shape = TreeShape::fixed(8, 4).leaf_capacity(4).fanout(4);
    let (image, built) = build_u64_tree(0..256u64, &shape)?;
    let tree = open_physical(&image, &built, BTreeOptions::default().cache_capacity(3))?;
    assert_eq!(collect_keys(&tree)?.len(), 256);
    assert!(tree.cached_nodes() <= 3);
    let stats = tree.stats_snapshot();
    assert!(stats.cache_evictions > 0);
    assert_eq!(stats.node_decodes, stats.node_reads);

    tree.clear_cache();
    assert_eq!(tree.cached_nodes(), 0);
    assert!(tree.lookup(&u64_key(200), &compare_u64_key, true)?.is_some());
    Ok(())
}

#[cfg(feature = "node-cache")]
#[test]
fn cached_node_keeps_first_parent() -> Result<()> {
    let (image, built) = split_at_100()?;
    let tree = open_physical(&image, &built, BTreeOptions::default())?;
    let root = Arc::clone(tree.root());
    let leaf_id = root.child_at(0)?;

    let first = tree.get_node(leaf_id, Some(&root), 0)?.expect("leaf");
    let again = tree.get_node(leaf_id, Some(&root), 1)?.expect("leaf");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.parent_index(), 0);
    assert!(Arc::ptr_eq(again.parent().expect("parent"), &root));
    Ok(())
}

#[test]
fn randomized_virtual_tree_matches_reference() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_a9f5);
    let mut reference = BTreeMap::new();
    while reference.len() < 2_000 {
        reference.insert(rng.gen_range(0..1_000_000u64), rng.gen::<u32>());
    }
    let mut image = ImageBuilder::new(TEST_BLOCK_SIZE)?;
    let shape = TreeShape::fixed(8, 4)
        .virtual_oids(0x4000)
        .leaf_capacity(50)
        .fanout(8);
    let records = reference
        .iter()
        .map(|(k, v)| Record::u64(*k, v.to_le_bytes().to_vec()))
        .collect();
    let built = image.tree(&shape, records)?;
    let mapper = Arc::new(MapTable::from_tree(&built));
    let tree = BTree::open(image.source(), built.root, built.xid, Some(mapper), BTreeOptions::default())?;

    for _ in 0..500 {
        let probe = rng.gen_range(0..1_000_000u64);
        for mode in MODES {
            let found = tree
                .lookup_with(&u64_key(probe), &compare_u64_key, mode)?
                .map(|e| key_u64(e.key()));
            assert_eq!(found, reference_find(&reference, probe, mode), "{mode:?} {probe}");
        }
    }
    let keys = collect_keys(&tree)?;
    assert_eq!(keys, reference.keys().copied().collect::<Vec<_>>());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn find_modes_match_btreemap(
        keys in prop::collection::btree_set(0u64..5_000, 0..400),
        probes in prop::collection::vec(0u64..5_100, 1..32),
        leaf_capacity in 2usize..40,
    ) {
        let reference: BTreeMap<u64, u32> = keys.iter().map(|k| (*k, *k as u32)).collect();
        let shape = TreeShape::fixed(8, 4).leaf_capacity(leaf_capacity).fanout(4);
        let (image, built) = build_u64_tree(keys.iter().copied(), &shape).unwrap();
        let tree = open_physical(&image, &built, BTreeOptions::default()).unwrap();
        for probe in probes {
            for mode in MODES {
                let found = tree
                    .lookup_with(&u64_key(probe), &compare_u64_key, mode)
                    .unwrap()
                    .map(|e| key_u64(e.key()));
                prop_assert_eq!(found, reference_find(&reference, probe, mode));
            }
        }
        prop_assert_eq!(collect_keys(&tree).unwrap(), keys.into_iter().collect::<Vec<_>>());
    }
}

use hcasfs::fs::codec::{lookup, DirBuilder};
use hcasfs::fs::InodeData;
use hcasfs::name::compute_name;
use hcasfs::ObjectName;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

fn reg(content: &[u8]) -> InodeData {
    InodeData {
        mode: libc::S_IFREG as u32 | 0o644,
        uid: 1000,
        gid: 1000,
        rdev: 0,
        atime_ns: 1,
        mtime_ns: 2,
        ctime_ns: 3,
        size: content.len() as u64,
        object: Some(compute_name(content, &[])),
    }
}

fn dir(object: ObjectName, size: u64) -> InodeData {
    InodeData {
        mode: libc::S_IFDIR as u32 | 0o755,
        uid: 0,
        gid: 0,
        rdev: 0,
        atime_ns: 0,
        mtime_ns: 0,
        ctime_ns: 0,
        size,
        object: Some(object),
    }
}

#[test]
fn fruit_directory_lookup_and_offsets() {
    let mut b = DirBuilder::new();
    b.push("apple", reg(b"apple-data"), 1).unwrap();
    b.push("banana", dir(compute_name(b"banana-dir", &[]), 100), 3).unwrap();
    b.push("cherry", reg(b"cherry-data"), 1).unwrap();
    let blob = b.build().unwrap();
    assert_eq!(blob.subtree_size, 6);

    let mut cur = Cursor::new(&blob.bytes);
    let banana = lookup(&mut cur, "banana").unwrap().unwrap();
    assert_eq!(banana.inode.size, 100);
    assert_eq!(lookup(&mut cur, "date").unwrap(), None);

    // pre-order offsets accumulate subtree sizes in CRC index order
    let subtree = |name: &str| -> u64 {
        if name == "banana" { 3 } else { 1 }
    };
    let mut names = ["apple", "banana", "cherry"];
    names.sort_by_key(|n| crc32fast::hash(n.as_bytes()));
    let mut expect = HashMap::new();
    let mut running = 1u64;
    for n in names {
        expect.insert(n, running);
        running += subtree(n);
    }
    for (n, want) in expect {
        let e = lookup(&mut cur, n).unwrap().unwrap();
        assert_eq!(e.pre_index, want, "offset of {}", n);
    }
}

/// Walk a multi-level tree the way a mount derives node ids and check the
/// ids exactly tile the root's subtree.
#[test]
fn derived_node_ids_are_unique_and_dense() {
    // blobs addressed by name, standing in for the store
    let mut blobs: HashMap<ObjectName, Vec<u8>> = HashMap::new();

    // leaf directory: d = { e }
    let mut b = DirBuilder::new();
    b.push("e", reg(b"e"), 1).unwrap();
    let d_blob = b.build().unwrap();
    let d_name = compute_name(&d_blob.bytes, &d_blob.deps);
    let d_subtree = d_blob.subtree_size;
    blobs.insert(d_name, d_blob.bytes);

    // middle directory: b = { c, d }
    let mut bld = DirBuilder::new();
    bld.push("c", reg(b"c"), 1).unwrap();
    bld.push("d", dir(d_name, 0), d_subtree).unwrap();
    let b_blob = bld.build().unwrap();
    let b_name = compute_name(&b_blob.bytes, &b_blob.deps);
    let b_subtree = b_blob.subtree_size;
    blobs.insert(b_name, b_blob.bytes);

    // root = { a, b, f }
    let mut bld = DirBuilder::new();
    bld.push("a", reg(b"a"), 1).unwrap();
    bld.push("b", dir(b_name, 0), b_subtree).unwrap();
    bld.push("f", reg(b"f"), 1).unwrap();
    let root_blob = bld.build().unwrap();
    let root_subtree = root_blob.subtree_size;
    assert_eq!(root_subtree, 7);

    let mut ids = HashSet::new();
    let root_id = 1u64;
    ids.insert(root_id);

    fn walk(
        blobs: &HashMap<ObjectName, Vec<u8>>,
        bytes: &[u8],
        node_id: u64,
        ids: &mut HashSet<u64>,
    ) {
        let entries =
            hcasfs::fs::codec::list_entries(&mut Cursor::new(bytes)).unwrap();
        for e in entries {
            let child_id = node_id + e.pre_index;
            assert!(ids.insert(child_id), "node id {} collided", child_id);
            if e.inode.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                let child_bytes = &blobs[e.inode.object.as_ref().unwrap()];
                walk(blobs, child_bytes, child_id, ids);
            }
        }
    }
    walk(&blobs, &root_blob.bytes, root_id, &mut ids);

    assert_eq!(ids.len() as u64, root_subtree);
    let expected: HashSet<u64> = (root_id..root_id + root_subtree).collect();
    assert_eq!(ids, expected);
}

#[test]
fn header_subtree_matches_builder_output() {
    let mut b = DirBuilder::new();
    b.push("one", reg(b"1"), 1).unwrap();
    b.push("two", dir(compute_name(b"sub", &[]), 0), 9).unwrap();
    let blob = b.build().unwrap();

    let mut cur = Cursor::new(&blob.bytes);
    let entries = hcasfs::fs::codec::list_entries(&mut cur).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(blob.subtree_size, 11);
}

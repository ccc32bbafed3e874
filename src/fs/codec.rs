//! Binary directory blob codec.
//!
//! Layout, all integers big-endian:
//! - 16-byte header: flags (must be zero), child count, the directory's own
//!   subtree size.
//! - child count index entries of 8 bytes each: record offset in the low
//!   half, filename CRC32 in the high half, sorted ascending by CRC.
//! - the records, each 8-byte aligned: a 96-byte fixed part followed by the
//!   filename and NUL padding.

use crate::*;
use crate::fs::{validate_entry_name, DirEntry, FileKind, InodeData, MAX_NAME_LEN};
use std::io::{Read, Seek, SeekFrom};

pub const DIR_HEADER_LEN: usize = 16;
pub const INDEX_ENTRY_LEN: usize = 8;
pub const RECORD_FIXED_LEN: usize = 96;
pub const RECORD_ALIGN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirHeader {
    pub flags: u32,
    pub count: u32,
    pub subtree_size: u64,
}

/// Result of building one directory: the encoded blob, the child object
/// names to hand to the writer as dependencies, and the directory's own
/// subtree size (1 plus the children's).
pub struct DirBlob {
    pub bytes: Vec<u8>,
    pub deps: Vec<ObjectName>,
    pub subtree_size: u64,
}

struct BuildEntry {
    name: String,
    crc: u32,
    inode: InodeData,
    subtree_size: u64,
}

/// Owns its entries and is consumed by [`DirBuilder::build`].
pub struct DirBuilder {
    entries: Vec<BuildEntry>,
}

impl DirBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, name: &str, inode: InodeData, subtree_size: u64) -> FsResult<()> {
        validate_entry_name(name.as_bytes())?;
        let kind = inode.kind()?;
        if inode.object.is_some() != kind.has_blob() {
            return Err(FsError::InvalidFormat);
        }
        if kind != FileKind::Dir && subtree_size != 1 {
            return Err(FsError::InvalidFormat);
        }
        if subtree_size == 0 {
            return Err(FsError::InvalidFormat);
        }
        self.entries.push(BuildEntry {
            crc: crc32fast::hash(name.as_bytes()),
            name: name.to_owned(),
            inode,
            subtree_size,
        });
        Ok(())
    }

    pub fn build(mut self) -> FsResult<DirBlob> {
        // ascending CRC; collisions stay in insertion order and are probed
        // as a chain on lookup
        self.entries.sort_by_key(|e| e.crc);

        // pre-order offsets: first child is 1, each next one past the
        // previous child's whole subtree
        let mut pre = Vec::with_capacity(self.entries.len());
        let mut running = 1u64;
        for e in &self.entries {
            pre.push(running);
            running += e.subtree_size;
        }
        let subtree_size = running;

        let count = self.entries.len() as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&subtree_size.to_be_bytes());
        // index patched after the records are laid out
        bytes.resize(DIR_HEADER_LEN + count as usize * INDEX_ENTRY_LEN, 0);

        let mut offsets = Vec::with_capacity(self.entries.len());
        for (e, &pre_index) in self.entries.iter().zip(&pre) {
            offsets.push(bytes.len() as u32);
            encode_record(&mut bytes, &e.name, &e.inode, pre_index);
        }

        for (i, (e, off)) in self.entries.iter().zip(&offsets).enumerate() {
            let at = DIR_HEADER_LEN + i * INDEX_ENTRY_LEN;
            bytes[at..at + 4].copy_from_slice(&off.to_be_bytes());
            bytes[at + 4..at + 8].copy_from_slice(&e.crc.to_be_bytes());
        }

        let deps = self
            .entries
            .iter()
            .filter_map(|e| e.inode.object)
            .collect();

        Ok(DirBlob {
            bytes,
            deps,
            subtree_size,
        })
    }
}

fn encode_record(out: &mut Vec<u8>, name: &str, inode: &InodeData, pre_index: u64) {
    debug_assert_eq!(out.len() % RECORD_ALIGN, 0);
    out.extend_from_slice(&inode.mode.to_be_bytes());
    out.extend_from_slice(&inode.uid.to_be_bytes());
    out.extend_from_slice(&inode.gid.to_be_bytes());
    out.extend_from_slice(&inode.rdev.to_be_bytes());
    out.extend_from_slice(&inode.atime_ns.to_be_bytes());
    out.extend_from_slice(&inode.mtime_ns.to_be_bytes());
    out.extend_from_slice(&inode.ctime_ns.to_be_bytes());
    out.extend_from_slice(&inode.size.to_be_bytes());
    match &inode.object {
        Some(obj) => out.extend_from_slice(obj.as_bytes()),
        None => out.extend_from_slice(&[0u8; name::NAME_LEN]),
    }
    out.extend_from_slice(&pre_index.to_be_bytes());
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    let pad = (RECORD_ALIGN - (RECORD_FIXED_LEN + name.len()) % RECORD_ALIGN) % RECORD_ALIGN;
    out.extend_from_slice(&[0u8; RECORD_ALIGN][..pad]);
}

fn read_exact_fmt<R: Read>(r: &mut R, buf: &mut [u8]) -> FsResult<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FsError::InvalidFormat
        } else {
            e.into()
        }
    })
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes(b.try_into().unwrap())
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b.try_into().unwrap())
}

fn be_i64(b: &[u8]) -> i64 {
    i64::from_be_bytes(b.try_into().unwrap())
}

/// Read and validate the 16-byte header at the reader's current position.
pub fn read_header<R: Read>(r: &mut R) -> FsResult<DirHeader> {
    let mut buf = [0u8; DIR_HEADER_LEN];
    read_exact_fmt(r, &mut buf)?;
    let flags = be_u32(&buf[0..4]);
    if flags != 0 {
        return Err(FsError::InvalidFormat);
    }
    Ok(DirHeader {
        flags,
        count: be_u32(&buf[4..8]),
        subtree_size: be_u64(&buf[8..16]),
    })
}

/// `(record offset, filename crc)` of index entry `i`.
pub fn read_index_entry<R: Read + Seek>(r: &mut R, i: u32) -> FsResult<(u32, u32)> {
    r.seek(SeekFrom::Start(
        (DIR_HEADER_LEN + i as usize * INDEX_ENTRY_LEN) as u64,
    ))?;
    let mut buf = [0u8; INDEX_ENTRY_LEN];
    read_exact_fmt(r, &mut buf)?;
    Ok((be_u32(&buf[0..4]), be_u32(&buf[4..8])))
}

/// Decode one record at the reader's current position, leaving the reader
/// positioned at the next record.
pub fn read_record<R: Read>(r: &mut R) -> FsResult<DirEntry> {
    let mut buf = [0u8; RECORD_FIXED_LEN];
    read_exact_fmt(r, &mut buf)?;

    let mode = be_u32(&buf[0..4]);
    let kind = FileKind::from_mode(mode)?;
    let name_len = be_u32(&buf[92..96]) as usize;
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(FsError::InvalidFormat);
    }

    let mut name_buf = vec![0u8; name_len];
    read_exact_fmt(r, &mut name_buf)?;
    let name = validate_entry_name(&name_buf)
        .map_err(|_| FsError::InvalidFormat)?
        .to_owned();

    let pad = (RECORD_ALIGN - (RECORD_FIXED_LEN + name_len) % RECORD_ALIGN) % RECORD_ALIGN;
    if pad > 0 {
        let mut pad_buf = [0u8; RECORD_ALIGN];
        read_exact_fmt(r, &mut pad_buf[..pad])?;
    }

    let object = if kind.has_blob() {
        Some(ObjectName::from_slice(&buf[52..84])?)
    } else {
        None
    };

    Ok(DirEntry {
        name,
        inode: InodeData {
            mode,
            uid: be_u32(&buf[4..8]),
            gid: be_u32(&buf[8..12]),
            rdev: be_u64(&buf[12..20]),
            atime_ns: be_i64(&buf[20..28]),
            mtime_ns: be_i64(&buf[28..36]),
            ctime_ns: be_i64(&buf[36..44]),
            size: be_u64(&buf[44..52]),
            object,
        },
        pre_index: be_u64(&buf[84..92]),
    })
}

fn read_record_at<R: Read + Seek>(r: &mut R, offset: u32) -> FsResult<DirEntry> {
    r.seek(SeekFrom::Start(offset as u64))?;
    read_record(r)
}

/// Find the entry named `name`, or `None`.
///
/// Interpolation search over the CRC index, then a probe of the collision
/// chain around the hit. Pure over an immutable blob, safe for concurrent
/// readers on independent reader handles.
pub fn lookup<R: Read + Seek>(r: &mut R, name: &str) -> FsResult<Option<DirEntry>> {
    validate_entry_name(name.as_bytes())?;
    let target = crc32fast::hash(name.as_bytes());

    r.seek(SeekFrom::Start(0))?;
    let hdr = read_header(r)?;
    if hdr.count == 0 {
        return Ok(None);
    }

    let mut lo = 0u32;
    let mut hi = hdr.count;
    let mut lo_crc: u64 = 0;
    let mut hi_crc: u64 = u32::MAX as u64;
    let mut hit = None;

    while lo < hi {
        let t = target as u64;
        if t < lo_crc || t > hi_crc {
            break;
        }
        let span = (hi - lo) as u64;
        let width = hi_crc - lo_crc + 1;
        let pos = lo + ((t - lo_crc) * span / width) as u32;

        let (_, crc) = read_index_entry(r, pos)?;
        if crc == target {
            hit = Some(pos);
            break;
        }
        if crc < target {
            lo = pos + 1;
            lo_crc = crc as u64 + 1;
        } else {
            hi = pos;
            hi_crc = crc as u64 - 1;
        }
    }

    let hit = match hit {
        Some(i) => i,
        None => return Ok(None),
    };

    let (off, _) = read_index_entry(r, hit)?;
    let entry = read_record_at(r, off)?;
    if entry.name == name {
        return Ok(Some(entry));
    }

    // same CRC, different name: probe the rest of the chain outwards
    let mut i = hit + 1;
    while i < hdr.count {
        let (off, crc) = read_index_entry(r, i)?;
        if crc != target {
            break;
        }
        let entry = read_record_at(r, off)?;
        if entry.name == name {
            return Ok(Some(entry));
        }
        i += 1;
    }
    let mut i = hit;
    while i > 0 {
        i -= 1;
        let (off, crc) = read_index_entry(r, i)?;
        if crc != target {
            break;
        }
        let entry = read_record_at(r, off)?;
        if entry.name == name {
            return Ok(Some(entry));
        }
    }

    Ok(None)
}

/// Decode every entry in index order, for listings.
pub fn list_entries<R: Read + Seek>(r: &mut R) -> FsResult<Vec<DirEntry>> {
    r.seek(SeekFrom::Start(0))?;
    let hdr = read_header(r)?;
    r.seek(SeekFrom::Start(
        (DIR_HEADER_LEN + hdr.count as usize * INDEX_ENTRY_LEN) as u64,
    ))?;
    let mut out = Vec::with_capacity(hdr.count as usize);
    for _ in 0..hdr.count {
        out.push(read_record(r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reg_inode(seed: u8) -> InodeData {
        InodeData {
            mode: libc::S_IFREG as u32 | 0o644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            atime_ns: 1_600_000_000_000_000_000 + seed as i64,
            mtime_ns: 1_600_000_000_000_000_001 + seed as i64,
            ctime_ns: 1_600_000_000_000_000_002 + seed as i64,
            size: seed as u64 * 7,
            object: Some(name::compute_name(&[seed], &[])),
        }
    }

    fn dir_inode() -> InodeData {
        InodeData {
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            size: 4096,
            object: Some(name::compute_name(b"dirblob", &[])),
        }
    }

    #[test]
    fn build_lookup_round_trip() {
        let mut b = DirBuilder::new();
        b.push("apple", reg_inode(1), 1).unwrap();
        b.push("banana", dir_inode(), 3).unwrap();
        b.push("cherry", reg_inode(2), 1).unwrap();
        let blob = b.build().unwrap();
        assert_eq!(blob.subtree_size, 6);
        assert_eq!(blob.deps.len(), 3);

        let mut cur = Cursor::new(&blob.bytes);
        for name in ["apple", "banana", "cherry"] {
            let e = lookup(&mut cur, name).unwrap().unwrap();
            assert_eq!(e.name, name);
        }
        assert_eq!(lookup(&mut cur, "date").unwrap(), None);

        let banana = lookup(&mut cur, "banana").unwrap().unwrap();
        assert_eq!(banana.inode, dir_inode());
    }

    #[test]
    fn record_round_trip_bitwise() {
        let inode = InodeData {
            mode: libc::S_IFCHR as u32 | 0o600,
            uid: 42,
            gid: 43,
            rdev: (5 << 8) | 1,
            atime_ns: -1,
            mtime_ns: i64::MAX,
            ctime_ns: 0,
            size: u64::MAX,
            object: None,
        };
        let mut buf = Vec::new();
        encode_record(&mut buf, "tty", &inode, 9);
        let e = read_record(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(e.name, "tty");
        assert_eq!(e.pre_index, 9);
        assert_eq!(e.inode, inode);
    }

    #[test]
    fn pre_order_indices_follow_subtree_sizes() {
        let mut b = DirBuilder::new();
        let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
        let subtrees = [1u64, 4, 1, 2, 1];
        for (name, &st) in names.iter().zip(&subtrees) {
            if st == 1 {
                b.push(name, reg_inode(7), 1).unwrap();
            } else {
                b.push(name, dir_inode(), st).unwrap();
            }
        }
        let blob = b.build().unwrap();
        assert_eq!(blob.subtree_size, 1 + subtrees.iter().sum::<u64>());

        let mut entries = list_entries(&mut Cursor::new(&blob.bytes)).unwrap();
        entries.sort_by_key(|e| e.pre_index);
        // first child sits at offset 1, each next one past the previous
        // child's whole subtree; every offset is distinct and in range
        assert_eq!(entries[0].pre_index, 1);
        let by_name: std::collections::HashMap<&str, u64> = names
            .iter()
            .zip(&subtrees)
            .map(|(n, &s)| (*n, s))
            .collect();
        let mut expect = 1;
        for e in &entries {
            assert_eq!(e.pre_index, expect);
            expect += by_name[e.name.as_str()];
        }
        assert_eq!(expect, blob.subtree_size);
    }

    #[test]
    fn crc_collision_chain_lookup() {
        // a classic CRC32 colliding pair
        assert_eq!(crc32fast::hash(b"plumless"), crc32fast::hash(b"buckeroo"));

        let mut b = DirBuilder::new();
        b.push("plumless", reg_inode(1), 1).unwrap();
        b.push("buckeroo", reg_inode(2), 1).unwrap();
        b.push("other", reg_inode(3), 1).unwrap();
        let blob = b.build().unwrap();

        let mut cur = Cursor::new(&blob.bytes);
        let p = lookup(&mut cur, "plumless").unwrap().unwrap();
        let q = lookup(&mut cur, "buckeroo").unwrap().unwrap();
        assert_eq!(p.inode.object, reg_inode(1).object);
        assert_eq!(q.inode.object, reg_inode(2).object);
    }

    #[test]
    fn empty_directory() {
        let blob = DirBuilder::new().build().unwrap();
        assert_eq!(blob.subtree_size, 1);
        let mut cur = Cursor::new(&blob.bytes);
        assert_eq!(lookup(&mut cur, "anything").unwrap(), None);
        assert!(list_entries(&mut Cursor::new(&blob.bytes)).unwrap().is_empty());
    }

    #[test]
    fn larger_directory_finds_everything() {
        let mut b = DirBuilder::new();
        let names: Vec<String> = (0..200).map(|i| format!("file-{:03}", i)).collect();
        for (i, n) in names.iter().enumerate() {
            b.push(n, reg_inode(i as u8), 1).unwrap();
        }
        let blob = b.build().unwrap();
        let mut cur = Cursor::new(&blob.bytes);
        for n in &names {
            assert_eq!(lookup(&mut cur, n).unwrap().unwrap().name, *n);
        }
        assert_eq!(lookup(&mut cur, "file-200").unwrap(), None);
        assert_eq!(lookup(&mut cur, "absent").unwrap(), None);
    }

    #[test]
    fn nonzero_flags_rejected() {
        let mut b = DirBuilder::new();
        b.push("a", reg_inode(0), 1).unwrap();
        let mut blob = b.build().unwrap();
        blob.bytes[0] = 1;
        let mut cur = Cursor::new(&blob.bytes);
        assert!(matches!(lookup(&mut cur, "a"), Err(FsError::InvalidFormat)));
    }

    #[test]
    fn truncated_blob_rejected() {
        let mut b = DirBuilder::new();
        b.push("abc", reg_inode(0), 1).unwrap();
        let blob = b.build().unwrap();
        let cut = &blob.bytes[..blob.bytes.len() - 4];
        let mut cur = Cursor::new(cut);
        assert!(matches!(
            list_entries(&mut cur),
            Err(FsError::InvalidFormat)
        ));
    }

    #[test]
    fn builder_rejects_invalid_entries() {
        let mut b = DirBuilder::new();
        assert!(matches!(
            b.push("a/b", reg_inode(0), 1),
            Err(FsError::InvalidName)
        ));
        // blob presence must match the file type
        let mut blobless_reg = reg_inode(0);
        blobless_reg.object = None;
        assert!(matches!(
            b.push("x", blobless_reg, 1),
            Err(FsError::InvalidFormat)
        ));
        let mut dev_with_blob = reg_inode(0);
        dev_with_blob.mode = libc::S_IFCHR as u32 | 0o600;
        assert!(matches!(
            b.push("y", dev_with_blob, 1),
            Err(FsError::InvalidFormat)
        ));
        // non-directories always have subtree size 1
        assert!(matches!(
            b.push("z", reg_inode(0), 2),
            Err(FsError::InvalidFormat)
        ));
    }
}

//! Import a POSIX ustar stream into the store.
//!
//! The whole archive is consumed into an in-memory tree first: file and
//! symlink bodies stream straight into blob writers, hard links are
//! deferred, then directories are committed bottom-up so every directory
//! blob can name its children as dependencies. Well-formed archives list a
//! directory before its contents; anything else is rejected.

use crate::*;
use crate::fs::codec::DirBuilder;
use crate::fs::{validate_entry_name, InodeData};
use crate::store::Session;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use tar::{Archive, EntryType, Header};

const COPY_CHUNK: usize = 64 * 1024;

struct ChildSlot {
    inode: InodeData,
    /// arena index for directories, `None` for everything else
    dir: Option<usize>,
}

struct DirNode {
    inode: InodeData,
    /// archive order preserved; names are unique
    children: Vec<(String, ChildSlot)>,
}

impl DirNode {
    fn upsert_child(&mut self, name: &str, slot: ChildSlot) {
        if let Some((_, old)) = self.children.iter_mut().find(|(n, _)| n == name) {
            *old = slot;
        } else {
            self.children.push((name.to_owned(), slot));
        }
    }

    fn find_child(&self, name: &str) -> Option<&ChildSlot> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

/// Sniff the gzip magic and import either a compressed or a plain stream.
pub fn import_tar_auto<R: Read>(session: &Session, reader: R) -> FsResult<ObjectName> {
    let mut br = BufReader::new(reader);
    let head = br.fill_buf()?;
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        import_tar(session, GzDecoder::new(br))
    } else {
        import_tar(session, br)
    }
}

pub fn import_tar<R: Read>(session: &Session, reader: R) -> FsResult<ObjectName> {
    let mut archive = Archive::new(reader);

    let mut nodes = vec![DirNode {
        inode: root_inode(),
        children: Vec::new(),
    }];
    // directory path -> arena index
    let mut dirs: HashMap<String, usize> = HashMap::from([(String::new(), 0)]);
    // (parent arena index, entry name, target path), resolved after the
    // stream is fully consumed
    let mut hard_links: Vec<(usize, String, String)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        let path_bytes = entry.path_bytes().into_owned();
        let path_str = match std::str::from_utf8(&path_bytes) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                warn!("tar: skipping entry with non-utf8 path");
                continue;
            }
        };
        let segs = match normalize_path(&path_str) {
            Ok(s) => s,
            Err(_) => {
                warn!("tar: skipping entry with invalid path {:?}", path_str);
                continue;
            }
        };

        let etype = entry.header().entry_type();
        if segs.is_empty() {
            // the archive's own "./" entry refreshes the root metadata
            if etype == EntryType::Directory {
                nodes[0].inode = inode_from_header(entry.header(), libc::S_IFDIR as u32, 0, 0)?;
            }
            continue;
        }

        let (parent_segs, base) = segs.split_at(segs.len() - 1);
        let base = base[0].clone();
        let parent_key = parent_segs.join("/");
        let parent_idx = *dirs
            .get(&parent_key)
            .ok_or(FsError::OutOfOrderArchive)?;

        match etype {
            EntryType::Directory => {
                let inode = inode_from_header(entry.header(), libc::S_IFDIR as u32, 0, 0)?;
                let key = segs.join("/");
                match dirs.get(&key) {
                    Some(&idx) => nodes[idx].inode = inode,
                    None => {
                        let idx = nodes.len();
                        nodes.push(DirNode {
                            inode,
                            children: Vec::new(),
                        });
                        dirs.insert(key, idx);
                        nodes[parent_idx].upsert_child(&base, ChildSlot {
                            inode: root_inode(),
                            dir: Some(idx),
                        });
                    }
                }
            }
            t if t.is_file() => {
                let size = entry.header().size()?;
                let mut w = session.writer(&[]);
                let mut buf = vec![0u8; COPY_CHUNK];
                loop {
                    let n = entry.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    w.write_all(&buf[..n])?;
                }
                let object = w.close()?;
                let mut inode =
                    inode_from_header(entry.header(), libc::S_IFREG as u32, size, 0)?;
                inode.object = Some(object);
                nodes[parent_idx].upsert_child(&base, ChildSlot { inode, dir: None });
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name_bytes()
                    .ok_or(FsError::InvalidFormat)?
                    .into_owned();
                let object = session.put_object(&target, &[])?;
                let mut inode = inode_from_header(
                    entry.header(),
                    libc::S_IFLNK as u32,
                    target.len() as u64,
                    0,
                )?;
                inode.object = Some(object);
                nodes[parent_idx].upsert_child(&base, ChildSlot { inode, dir: None });
            }
            EntryType::Link => {
                let target = entry
                    .link_name_bytes()
                    .ok_or(FsError::BrokenHardLink)?
                    .into_owned();
                let target = std::str::from_utf8(&target)
                    .map_err(|_| FsError::BrokenHardLink)?
                    .to_owned();
                hard_links.push((parent_idx, base, target));
            }
            EntryType::Char | EntryType::Block => {
                let major = entry.header().device_major()?.unwrap_or(0) as u64;
                let minor = entry.header().device_minor()?.unwrap_or(0) as u64;
                let type_bits = if etype == EntryType::Char {
                    libc::S_IFCHR
                } else {
                    libc::S_IFBLK
                } as u32;
                let inode =
                    inode_from_header(entry.header(), type_bits, 0, (major << 8) | minor)?;
                nodes[parent_idx].upsert_child(&base, ChildSlot { inode, dir: None });
            }
            EntryType::Fifo => {
                let inode = inode_from_header(entry.header(), libc::S_IFIFO as u32, 0, 0)?;
                nodes[parent_idx].upsert_child(&base, ChildSlot { inode, dir: None });
            }
            other => {
                warn!("tar: skipping {:?}, unsupported entry type {:?}", path_str, other);
            }
        }
    }

    resolve_hard_links(&mut nodes, &dirs, hard_links)?;

    let (root, _, _) = build_dir(session, &nodes, 0)?;
    Ok(root)
}

/// A hard link takes over the full inode of its target, which must already
/// exist as a regular file.
fn resolve_hard_links(
    nodes: &mut [DirNode],
    dirs: &HashMap<String, usize>,
    links: Vec<(usize, String, String)>,
) -> FsResult<()> {
    for (parent_idx, base, target) in links {
        let segs = normalize_path(&target).map_err(|_| FsError::BrokenHardLink)?;
        if segs.is_empty() {
            return Err(FsError::BrokenHardLink);
        }
        let (tparent, tbase) = segs.split_at(segs.len() - 1);
        let tparent_idx = *dirs
            .get(&tparent.join("/"))
            .ok_or(FsError::BrokenHardLink)?;
        let slot = nodes[tparent_idx]
            .find_child(&tbase[0])
            .ok_or(FsError::BrokenHardLink)?;
        if slot.dir.is_some() || slot.inode.mode & libc::S_IFMT != libc::S_IFREG {
            return Err(FsError::BrokenHardLink);
        }
        let inode = slot.inode.clone();
        nodes[parent_idx].upsert_child(&base, ChildSlot { inode, dir: None });
    }
    Ok(())
}

/// Commit directory blobs children-first so each blob can depend on its
/// children by name.
fn build_dir(
    session: &Session,
    nodes: &[DirNode],
    idx: usize,
) -> FsResult<(ObjectName, u64, u64)> {
    let node = &nodes[idx];
    let mut builder = DirBuilder::new();
    for (name, child) in &node.children {
        match child.dir {
            Some(cidx) => {
                let (object, subtree, blob_len) = build_dir(session, nodes, cidx)?;
                let mut inode = nodes[cidx].inode.clone();
                inode.object = Some(object);
                inode.size = blob_len;
                builder.push(name, inode, subtree)?;
            }
            None => builder.push(name, child.inode.clone(), 1)?,
        }
    }
    let blob = builder.build()?;
    let blob_len = blob.bytes.len() as u64;
    let mut w = session.writer(&blob.deps);
    w.write_all(&blob.bytes)?;
    Ok((w.close()?, blob.subtree_size, blob_len))
}

fn root_inode() -> InodeData {
    InodeData {
        mode: libc::S_IFDIR as u32 | 0o755,
        uid: 0,
        gid: 0,
        rdev: 0,
        atime_ns: 0,
        mtime_ns: 0,
        ctime_ns: 0,
        size: 0,
        object: None,
    }
}

/// Split an archive path into validated segments. Empty and `.` segments
/// vanish; `..` and malformed names are errors.
fn normalize_path(raw: &str) -> FsResult<Vec<String>> {
    let mut segs = Vec::new();
    for seg in raw.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(FsError::InvalidName);
        }
        validate_entry_name(seg.as_bytes())?;
        segs.push(seg.to_owned());
    }
    Ok(segs)
}

/// Archive headers carry second-resolution times; the codec stores
/// nanoseconds.
fn inode_from_header(
    header: &Header,
    type_bits: u32,
    size: u64,
    rdev: u64,
) -> FsResult<InodeData> {
    let mtime_ns = (header.mtime()? as i64).wrapping_mul(1_000_000_000);
    Ok(InodeData {
        mode: type_bits | (header.mode()? & 0o7777),
        uid: header.uid()? as u32,
        gid: header.gid()? as u32,
        rdev,
        atime_ns: mtime_ns,
        mtime_ns,
        ctime_ns: mtime_ns,
        size,
        object: None,
    })
}

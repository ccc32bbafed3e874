use crate::*;
use crate::fs::codec;
use crate::fs::{DirEntry, FileKind, InodeData};
use crate::fuse::handle::{DirHandle, FileHandle, Handle, HandleTable};
use crate::fuse::inode::InodeTable;
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use libc::c_int;
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_TTL: Duration = Duration::new(1, 0);

macro_rules! fuse_try {
    ($res:expr, $reply:expr) => {
        match $res {
            Ok(v) => v,
            Err(e) => {
                debug!("request failed: {}", e);
                $reply.error(e.errno());
                return;
            }
        }
    };
}

/// POSIX mode check against the stored uid/gid/mode triple.
pub fn check_access(
    file_uid: u32,
    file_gid: u32,
    file_mode: u32,
    uid: u32,
    gid: u32,
    mut access_mask: i32,
) -> bool {
    // F_OK tests for existence of file
    if access_mask == libc::F_OK {
        return true;
    }
    let file_mode = (file_mode & 0o777) as i32;

    // root is allowed to read & write anything
    if uid == 0 {
        // root only allowed to exec if one of the X bits is set
        access_mask &= libc::X_OK;
        access_mask -= access_mask & (file_mode >> 6);
        access_mask -= access_mask & (file_mode >> 3);
        access_mask -= access_mask & file_mode;
        return access_mask == 0;
    }

    if uid == file_uid {
        access_mask -= access_mask & (file_mode >> 6);
    } else if gid == file_gid {
        access_mask -= access_mask & (file_mode >> 3);
    } else {
        access_mask -= access_mask & file_mode;
    }

    access_mask == 0
}

fn systime(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

fn attr_for(node_id: u64, inode: &InodeData) -> FsResult<fuser::FileAttr> {
    let kind: FileKind = inode.kind()?;
    Ok(fuser::FileAttr {
        ino: node_id,
        size: inode.size,
        blocks: (inode.size + 511) / 512,
        atime: systime(inode.atime_ns),
        mtime: systime(inode.mtime_ns),
        ctime: systime(inode.ctime_ns),
        crtime: systime(inode.mtime_ns),
        kind: kind.into(),
        perm: (inode.mode & 0o7777) as u16,
        nlink: 1,
        uid: inode.uid,
        gid: inode.gid,
        rdev: inode.rdev as u32,
        blksize: 4096,
        flags: 0,
    })
}

pub(crate) struct ServerState {
    store: Store,
    inodes: InodeTable,
    handles: HandleTable,
}

impl ServerState {
    fn lookup_child(&self, parent: &InodeData, name: &str) -> FsResult<Option<DirEntry>> {
        if parent.kind()? != FileKind::Dir {
            return Err(FsError::NotADirectory);
        }
        let object = parent.object.as_ref().ok_or(FsError::InvalidFormat)?;
        let mut file = self.store.open_object(object)?;
        codec::lookup(&mut file, name)
    }

    fn lookup(&self, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let parent_inode = fuse_try!(self.inodes.get(parent), reply);
        match fuse_try!(self.lookup_child(&parent_inode, name), reply) {
            Some(entry) => {
                let node_id = parent + entry.pre_index;
                let attr = fuse_try!(attr_for(node_id, &entry.inode), reply);
                // track first so a racing FORGET always finds the node
                fuse_try!(self.inodes.track(node_id, entry.inode), reply);
                reply.entry(&DEFAULT_TTL, &attr, 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&self, ino: u64, reply: ReplyAttr) {
        let inode = fuse_try!(self.inodes.get(ino), reply);
        let attr = fuse_try!(attr_for(ino, &inode), reply);
        reply.attr(&DEFAULT_TTL, &attr);
    }

    fn access(&self, ino: u64, mask: i32, uid: u32, gid: u32, reply: ReplyEmpty) {
        let inode = fuse_try!(self.inodes.get(ino), reply);
        if check_access(inode.uid, inode.gid, inode.mode, uid, gid, mask) {
            reply.ok();
        } else {
            reply.error(libc::EACCES);
        }
    }

    fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }
        let inode = fuse_try!(self.inodes.get(ino), reply);
        match fuse_try!(inode.kind(), reply) {
            FileKind::Reg => {
                let object = match inode.object.as_ref() {
                    Some(o) => o,
                    None => {
                        reply.error(libc::EIO);
                        return;
                    }
                };
                let file = fuse_try!(self.store.open_object(object), reply);
                let fh = fuse_try!(
                    self.handles.insert(Handle::File(FileHandle::new(file))),
                    reply
                );
                reply.opened(fh, 0);
            }
            FileKind::Dir => self.opendir(ino, flags, reply),
            // the kernel resolves symlinks via READLINK and opens device
            // nodes itself; no handle exists for either
            FileKind::Lnk => reply.opened(0, 0),
            _ => reply.error(libc::EIO),
        }
    }

    fn opendir(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }
        let inode = fuse_try!(self.inodes.get(ino), reply);
        if fuse_try!(inode.kind(), reply) != FileKind::Dir {
            reply.error(libc::ENOTDIR);
            return;
        }
        let object = match inode.object.as_ref() {
            Some(o) => o,
            None => {
                reply.error(libc::EIO);
                return;
            }
        };
        let file = fuse_try!(self.store.open_object(object), reply);
        let handle = fuse_try!(DirHandle::open(file), reply);
        let fh = fuse_try!(self.handles.insert(Handle::Dir(handle)), reply);
        reply.opened(fh, 0);
    }

    fn read(&self, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let handle = fuse_try!(self.handles.get(fh), reply);
        match &*handle {
            Handle::File(f) => {
                let data = fuse_try!(f.read_at(offset.max(0) as u64, size), reply);
                reply.data(&data);
            }
            Handle::Dir(_) => reply.error(libc::EISDIR),
        }
    }

    /// Stream dirents into the kernel buffer. The cookie space is the
    /// record index shifted by the two synthesised entries: 0 is `.`, 1 is
    /// `..`, and cookie `k >= 2` is record `k - 2`.
    fn readdir(&self, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let handle = fuse_try!(self.handles.get(fh), reply);
        let dir = match &*handle {
            Handle::Dir(d) => d,
            Handle::File(_) => {
                reply.error(libc::ENOTDIR);
                return;
            }
        };

        let mut pos = offset.max(0) as u64;
        loop {
            if pos == 0 {
                if reply.add(ino, 1, fuser::FileType::Directory, ".") {
                    break;
                }
                pos = 1;
            } else if pos == 1 {
                if reply.add(ino, 2, fuser::FileType::Directory, "..") {
                    break;
                }
                pos = 2;
            } else {
                let entry = match fuse_try!(dir.read_entry_at(pos - 2), reply) {
                    Some(e) => e,
                    None => break,
                };
                let kind: FileKind = fuse_try!(entry.inode.kind(), reply);
                if reply.add(
                    ino + entry.pre_index,
                    (pos + 1) as i64,
                    kind.into(),
                    entry.name.as_str(),
                ) {
                    break;
                }
                pos += 1;
            }
        }
        reply.ok();
    }

    fn readlink(&self, ino: u64, reply: ReplyData) {
        let inode = fuse_try!(self.inodes.get(ino), reply);
        if fuse_try!(inode.kind(), reply) != FileKind::Lnk {
            reply.error(libc::EINVAL);
            return;
        }
        let object = match inode.object.as_ref() {
            Some(o) => o,
            None => {
                reply.error(libc::EIO);
                return;
            }
        };
        let file = fuse_try!(self.store.open_object(object), reply);
        let mut target = Vec::new();
        fuse_try!(
            file.take(libc::PATH_MAX as u64 + 1)
                .read_to_end(&mut target)
                .map_err(FsError::from),
            reply
        );
        reply.data(&target);
    }

    fn release(&self, fh: u64, reply: ReplyEmpty) {
        fuse_try!(self.handles.remove(fh), reply);
        reply.ok();
    }

    fn statfs(&self, reply: ReplyStatfs) {
        let stat = fuse_try!(
            nix::sys::statvfs::statvfs(self.store.root()).map_err(FsError::from),
            reply
        );
        reply.statfs(
            stat.blocks() as u64,
            stat.blocks_free() as u64,
            stat.blocks_available() as u64,
            stat.files() as u64,
            stat.files_free() as u64,
            stat.block_size() as u32,
            stat.name_max() as u32,
            stat.fragment_size() as u32,
        );
    }
}

/// fuser shim: every request is dispatched onto its own worker thread over
/// the shared server state, so handlers may block on store I/O without
/// stalling the connection reader.
pub struct HcasFuse {
    state: Arc<ServerState>,
}

impl HcasFuse {
    pub fn new(store: Store, root_inode: InodeData) -> Self {
        Self {
            state: Arc::new(ServerState {
                store,
                inodes: InodeTable::new(root_inode),
                handles: HandleTable::new(),
            }),
        }
    }
}

impl Filesystem for HcasFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let state = self.state.clone();
        let name: OsString = name.to_owned();
        thread::spawn(move || state.lookup(parent, &name, reply));
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.state.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let state = self.state.clone();
        thread::spawn(move || state.getattr(ino, reply));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let state = self.state.clone();
        thread::spawn(move || state.readlink(ino, reply));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let state = self.state.clone();
        thread::spawn(move || state.open(ino, flags, reply));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let state = self.state.clone();
        thread::spawn(move || state.read(fh, offset, size, reply));
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let state = self.state.clone();
        thread::spawn(move || state.release(fh, reply));
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let state = self.state.clone();
        thread::spawn(move || state.opendir(ino, flags, reply));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let state = self.state.clone();
        thread::spawn(move || state.readdir(ino, fh, offset, reply));
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let state = self.state.clone();
        thread::spawn(move || state.release(fh, reply));
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let state = self.state.clone();
        thread::spawn(move || state.statfs(reply));
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        // xattrs are unsupported; answer every query with an empty result
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let state = self.state.clone();
        let (uid, gid) = (req.uid(), req.gid());
        thread::spawn(move || state.access(ino, mask, uid, gid, reply));
    }
}

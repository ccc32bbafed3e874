//! Import a local directory subtree into the store.
//!
//! The walk reads raw directory entries, opens children with no-follow
//! semantics, streams file bodies straight into blob writers, and commits
//! every directory blob with its children as dependencies.

use crate::*;
use crate::fs::codec::DirBuilder;
use crate::fs::{validate_entry_name, InodeData};
use crate::store::Session;
use nix::dir::Dir;
use nix::fcntl::{open, openat, readlinkat, AtFlags, OFlag};
use nix::sys::stat::{fstat, fstatat, FileStat, Mode};
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

const COPY_CHUNK: usize = 64 * 1024;

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(nix::Error::EINTR) => continue,
            other => return other,
        }
    }
}

fn ts_ns(sec: i64, nsec: i64) -> i64 {
    sec.wrapping_mul(1_000_000_000).wrapping_add(nsec)
}

fn inode_from_stat(st: &FileStat, size: u64, rdev: u64, object: Option<ObjectName>) -> InodeData {
    InodeData {
        mode: st.st_mode as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev,
        atime_ns: ts_ns(st.st_atime, st.st_atime_nsec),
        mtime_ns: ts_ns(st.st_mtime, st.st_mtime_nsec),
        ctime_ns: ts_ns(st.st_ctime, st.st_ctime_nsec),
        size,
        object,
    }
}

/// Import the tree rooted at `path` and return the root directory's name.
pub fn import_path(session: &Session, path: &Path) -> FsResult<ObjectName> {
    let fd = retry_eintr(|| {
        open(
            path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    })?;
    let (name, _, _) = import_dir_fd(session, fd)?;
    Ok(name)
}

/// Recursively import the directory owned by `fd`. Returns the committed
/// blob's name, the directory's subtree size, and the blob's length.
fn import_dir_fd(session: &Session, fd: RawFd) -> FsResult<(ObjectName, u64, u64)> {
    let mut dir = Dir::from_fd(fd)?;

    let mut raw_entries: Vec<(u64, Vec<u8>)> = Vec::new();
    for ent in dir.iter() {
        let ent = ent?;
        raw_entries.push((ent.ino(), ent.file_name().to_bytes().to_vec()));
    }
    let dirfd = dir.as_raw_fd();

    let mut builder = DirBuilder::new();
    for (ino, raw_name) in raw_entries {
        if raw_name == b"." || raw_name == b".." || ino == 0 {
            continue;
        }
        let name = match validate_entry_name(&raw_name) {
            Ok(n) => n.to_owned(),
            Err(_) => {
                warn!(
                    "import: skipping entry with invalid name {:?}",
                    String::from_utf8_lossy(&raw_name)
                );
                continue;
            }
        };
        // no NUL possible, validation rejected it
        let cname = CString::new(raw_name).map_err(|_| FsError::InvalidName)?;

        let st = retry_eintr(|| fstatat(dirfd, cname.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW))?;
        let (inode, subtree) = match st.st_mode & libc::S_IFMT {
            libc::S_IFREG => {
                let (object, st, size) = import_reg(session, dirfd, &cname)?;
                (inode_from_stat(&st, size, 0, Some(object)), 1)
            }
            libc::S_IFDIR => {
                let child_fd = match retry_eintr(|| {
                    openat(
                        dirfd,
                        cname.as_c_str(),
                        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                        Mode::empty(),
                    )
                }) {
                    Ok(fd) => fd,
                    Err(nix::Error::ENOTDIR) | Err(nix::Error::ELOOP) => {
                        return Err(FsError::UnexpectedFileType)
                    }
                    Err(e) => return Err(e.into()),
                };
                let st = retry_eintr(|| fstat(child_fd))?;
                let (object, subtree, blob_len) = import_dir_fd(session, child_fd)?;
                (inode_from_stat(&st, blob_len, 0, Some(object)), subtree)
            }
            libc::S_IFLNK => {
                let target = retry_eintr(|| readlinkat(dirfd, cname.as_c_str()))?;
                let bytes = target.as_os_str().as_bytes();
                let object = session.put_object(bytes, &[])?;
                (inode_from_stat(&st, bytes.len() as u64, 0, Some(object)), 1)
            }
            libc::S_IFCHR | libc::S_IFBLK => {
                (inode_from_stat(&st, 0, st.st_rdev, None), 1)
            }
            libc::S_IFIFO | libc::S_IFSOCK => (inode_from_stat(&st, 0, 0, None), 1),
            _ => {
                warn!("import: skipping {:?}, unsupported file type", name);
                continue;
            }
        };
        builder.push(&name, inode, subtree)?;
    }

    let blob = builder.build()?;
    let blob_len = blob.bytes.len() as u64;
    let mut w = session.writer(&blob.deps);
    w.write_all(&blob.bytes)?;
    let object = w.close()?;
    Ok((object, blob.subtree_size, blob_len))
}

/// Stream one regular file into a writer. The stat taken from the opened fd
/// is authoritative; a mismatch with the streamed byte count fails the
/// import rather than publishing a torn blob.
fn import_reg(
    session: &Session,
    dirfd: RawFd,
    cname: &CString,
) -> FsResult<(ObjectName, FileStat, u64)> {
    let fd = match retry_eintr(|| {
        openat(
            dirfd,
            cname.as_c_str(),
            OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    }) {
        Ok(fd) => fd,
        Err(nix::Error::ELOOP) => return Err(FsError::UnexpectedFileType),
        Err(e) => return Err(e.into()),
    };
    let mut file = unsafe { File::from_raw_fd(fd) };

    let st = retry_eintr(|| fstat(fd))?;
    if st.st_mode & libc::S_IFMT != libc::S_IFREG {
        return Err(FsError::UnexpectedFileType);
    }

    let mut w = session.writer(&[]);
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        w.write_all(&buf[..n])?;
        total += n as u64;
    }
    if total != st.st_size as u64 {
        return Err(FsError::SizeChanged);
    }
    Ok((w.close()?, st, total))
}

pub mod codec;
pub mod import;

use crate::*;

/// Longest allowed directory entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileKind {
    Reg,
    Dir,
    Lnk,
    Chr,
    Blk,
    Fifo,
    Sock,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> FsResult<Self> {
        match mode & libc::S_IFMT as u32 {
            libc::S_IFREG => Ok(FileKind::Reg),
            libc::S_IFDIR => Ok(FileKind::Dir),
            libc::S_IFLNK => Ok(FileKind::Lnk),
            libc::S_IFCHR => Ok(FileKind::Chr),
            libc::S_IFBLK => Ok(FileKind::Blk),
            libc::S_IFIFO => Ok(FileKind::Fifo),
            libc::S_IFSOCK => Ok(FileKind::Sock),
            _ => Err(FsError::InvalidFormat),
        }
    }

    /// Only regular files, directories and symlinks carry object data.
    pub fn has_blob(&self) -> bool {
        matches!(self, FileKind::Reg | FileKind::Dir | FileKind::Lnk)
    }
}

impl Into<fuser::FileType> for FileKind {
    fn into(self) -> fuser::FileType {
        match self {
            FileKind::Reg => fuser::FileType::RegularFile,
            FileKind::Dir => fuser::FileType::Directory,
            FileKind::Lnk => fuser::FileType::Symlink,
            FileKind::Chr => fuser::FileType::CharDevice,
            FileKind::Blk => fuser::FileType::BlockDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Sock => fuser::FileType::Socket,
        }
    }
}

/// Stat-shaped metadata of one encoded tree node. `object` is present
/// exactly for the kinds that carry blob data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InodeData {
    /// full unix mode, type and permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// device number for char/block devices, 0 otherwise
    pub rdev: u64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub size: u64,
    pub object: Option<ObjectName>,
}

impl InodeData {
    pub fn kind(&self) -> FsResult<FileKind> {
        FileKind::from_mode(self.mode)
    }
}

/// One decoded directory entry. `pre_index` is the entry's pre-order offset
/// from the directory itself; a mount adds it to the directory's node id to
/// derive the child's node id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeData,
    pub pre_index: u64,
}

/// Entry names are non-empty UTF-8 of at most [`MAX_NAME_LEN`] bytes with
/// no NUL and no `/`.
pub fn validate_entry_name(name: &[u8]) -> FsResult<&str> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidName);
    }
    if name.iter().any(|&b| b == 0 || b == b'/') {
        return Err(FsError::InvalidName);
    }
    std::str::from_utf8(name).map_err(|_| FsError::InvalidName)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_entry_name(b"ok").is_ok());
        assert!(validate_entry_name("änder".as_bytes()).is_ok());
        assert!(matches!(validate_entry_name(b""), Err(FsError::InvalidName)));
        assert!(matches!(validate_entry_name(b"a/b"), Err(FsError::InvalidName)));
        assert!(matches!(validate_entry_name(b"a\0b"), Err(FsError::InvalidName)));
        assert!(matches!(validate_entry_name(&[0xff, 0xfe]), Err(FsError::InvalidName)));
        let long = vec![b'x'; MAX_NAME_LEN + 1];
        assert!(matches!(validate_entry_name(&long), Err(FsError::InvalidName)));
        let max = vec![b'x'; MAX_NAME_LEN];
        assert!(validate_entry_name(&max).is_ok());
    }

    #[test]
    fn kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFREG | 0o644).unwrap(), FileKind::Reg);
        assert_eq!(FileKind::from_mode(libc::S_IFDIR | 0o755).unwrap(), FileKind::Dir);
        assert_eq!(FileKind::from_mode(libc::S_IFLNK | 0o777).unwrap(), FileKind::Lnk);
        assert!(FileKind::from_mode(0).is_err());
        assert!(!FileKind::from_mode(libc::S_IFSOCK).unwrap().has_blob());
    }
}

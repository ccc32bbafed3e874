use thiserror::Error;

use std::io::ErrorKind;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error")]
    IOError(#[from] std::io::Error),

    #[error("cannot find requested resource")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("object or file name is invalid")]
    InvalidName,

    #[error("directory data encoding is invalid")]
    InvalidFormat,

    #[error("file type does not match its directory entry")]
    UnexpectedFileType,

    #[error("file size changed while streaming")]
    SizeChanged,

    #[error("hard link target is missing or not a regular file")]
    BrokenHardLink,

    #[error("archive entry appears before its parent directory")]
    OutOfOrderArchive,

    #[error("referenced dependency is not present in the store")]
    DependencyMissing,

    #[error("metadata schema version mismatch")]
    VersionMismatch,

    #[error("metadata store is busy")]
    StoreBusy,

    #[error("metadata store error")]
    StoreIO(#[source] rusqlite::Error),

    #[error("handle is not open")]
    BadHandle,

    #[error("requested resource is not a directory")]
    NotADirectory,

    #[error("requested resource is a directory")]
    IsADirectory,

    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("operation or request not supported")]
    NotSupported,

    #[error("failed to lock or unlock rwlock")]
    RwLockError,

    #[error("failed to lock or unlock mutex")]
    MutexError,
}

pub type FsResult<T> = Result<T, FsError>;

impl From<rusqlite::Error> for FsError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => FsError::StoreBusy,
            _ => FsError::StoreIO(value),
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(value: nix::Error) -> Self {
        FsError::IOError(value.into())
    }
}

use libc::c_int;
impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::IOError(io_err) => {
                if let Some(errno) = io_err.raw_os_error() {
                    return errno;
                }
                match io_err.kind() {
                    ErrorKind::NotFound => libc::ENOENT,
                    ErrorKind::PermissionDenied => libc::EACCES,
                    ErrorKind::AlreadyExists => libc::EEXIST,
                    ErrorKind::WouldBlock => libc::EWOULDBLOCK,
                    ErrorKind::InvalidInput => libc::EINVAL,
                    ErrorKind::InvalidData => libc::EINVAL,
                    ErrorKind::TimedOut => libc::ETIMEDOUT,
                    ErrorKind::Interrupted => libc::EINTR,
                    ErrorKind::Unsupported => libc::ENOSYS,
                    _ => libc::EIO,
                }
            }
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::InvalidName => libc::EINVAL,
            FsError::InvalidFormat => libc::EINVAL,
            FsError::UnexpectedFileType => libc::EIO,
            FsError::SizeChanged => libc::EIO,
            FsError::BrokenHardLink => libc::EIO,
            FsError::OutOfOrderArchive => libc::EIO,
            FsError::DependencyMissing => libc::EIO,
            FsError::VersionMismatch => libc::EIO,
            FsError::StoreBusy => libc::EBUSY,
            FsError::StoreIO(_) => libc::EIO,
            FsError::BadHandle => libc::EBADF,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::ReadOnly => libc::EROFS,
            FsError::NotSupported => libc::ENOSYS,
            FsError::RwLockError => libc::EIO,
            FsError::MutexError => libc::EIO,
        }
    }
}

impl Into<c_int> for FsError {
    fn into(self) -> c_int {
        self.errno()
    }
}

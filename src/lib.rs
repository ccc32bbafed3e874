pub mod error;
pub mod name;
pub mod store;
pub mod fs;
pub mod fuse;

pub use error::*;
pub use name::ObjectName;
pub use store::{Session, Store, Writer};
pub use log::{warn, info, debug};

/// kernel node id of a mount's root directory
pub const ROOT_NODE_ID: u64 = 1;

/// label namespace that mountable image roots are published under
pub const IMAGE_NAMESPACE: &str = "image";

#[macro_export]
macro_rules! mutex_lock {
    ($mu: expr) => {
        $mu.lock().map_err(|_| FsError::MutexError)?
    };
}

#[macro_export]
macro_rules! rwlock_read {
    ($mu: expr) => {
        $mu.read().map_err(|_| FsError::RwLockError)?
    };
}

#[macro_export]
macro_rules! rwlock_write {
    ($mu: expr) => {
        $mu.write().map_err(|_| FsError::RwLockError)?
    };
}

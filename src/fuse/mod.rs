pub mod handle;
pub mod inode;
pub mod server;

pub use server::HcasFuse;

use crate::*;
use crate::fs::InodeData;
use fuser::MountOption;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mount the tree labelled `label` (in the image namespace) read-only at
/// `mountpoint`. Blocks until the filesystem is unmounted.
pub fn mount(store: Store, label: &str, mountpoint: &Path) -> FsResult<()> {
    // resolving through a session extends the root's lease, so the tree
    // survives a concurrent label swap for the life of the mount
    let session = store.session();
    let root_name = session
        .get_label(IMAGE_NAMESPACE, label)?
        .ok_or(FsError::NotFound)?;
    let size = store.object_len(&root_name)?;

    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let root_inode = InodeData {
        mode: libc::S_IFDIR as u32 | 0o755,
        uid: 0,
        gid: 0,
        rdev: 0,
        atime_ns: now_ns,
        mtime_ns: now_ns,
        ctime_ns: now_ns,
        size,
        object: Some(root_name),
    };

    info!("mounting {} at {}", root_name, mountpoint.display());
    fuser::mount2(
        HcasFuse::new(store, root_inode),
        mountpoint,
        &[
            MountOption::RO,
            MountOption::FSName("hcasfs".to_string()),
            MountOption::AutoUnmount,
        ],
    )?;
    Ok(())
}

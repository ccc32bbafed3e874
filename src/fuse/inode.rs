use crate::*;
use crate::fs::InodeData;
use std::collections::HashMap;
use std::sync::RwLock;

struct InodeSlot {
    inode: InodeData,
    refs: u64,
}

/// Process-local map from kernel node id to inode metadata.
///
/// Every `LOOKUP` response tracks the node first and answers the kernel
/// second, so a racing `FORGET` can never name an untracked node. The root
/// is pre-populated at id 1 and survives for the whole mount.
pub struct InodeTable {
    nodes: RwLock<HashMap<u64, InodeSlot>>,
}

impl InodeTable {
    pub fn new(root: InodeData) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE_ID, InodeSlot { inode: root, refs: 1 });
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn get(&self, node: u64) -> FsResult<InodeData> {
        let nodes = rwlock_read!(self.nodes);
        nodes
            .get(&node)
            .map(|slot| slot.inode.clone())
            .ok_or(FsError::NotFound)
    }

    /// Register one kernel reference for `node`.
    pub fn track(&self, node: u64, inode: InodeData) -> FsResult<()> {
        let mut nodes = rwlock_write!(self.nodes);
        nodes
            .entry(node)
            .and_modify(|slot| slot.refs += 1)
            .or_insert(InodeSlot { inode, refs: 1 });
        Ok(())
    }

    /// Drop `count` kernel references; the row disappears at zero.
    pub fn forget(&self, node: u64, count: u64) {
        let mut nodes = match self.nodes.write() {
            Ok(g) => g,
            Err(_) => {
                warn!("inode table lock poisoned on forget");
                return;
            }
        };
        match nodes.get_mut(&node) {
            Some(slot) if slot.refs > count => slot.refs -= count,
            Some(slot) => {
                if count > slot.refs {
                    warn!(
                        "forget of node {} drops {} refs but only {} held",
                        node, count, slot.refs
                    );
                }
                nodes.remove(&node);
            }
            None => warn!("forget of unknown node {}", node),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_inode() -> InodeData {
        InodeData {
            mode: libc::S_IFREG as u32 | 0o644,
            uid: 0,
            gid: 0,
            rdev: 0,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            size: 0,
            object: Some(name::compute_name(b"x", &[])),
        }
    }

    fn root_inode() -> InodeData {
        InodeData {
            mode: libc::S_IFDIR as u32 | 0o755,
            object: Some(name::compute_name(b"root", &[])),
            ..dummy_inode()
        }
    }

    #[test]
    fn root_is_prepopulated() {
        let t = InodeTable::new(root_inode());
        assert_eq!(t.get(ROOT_NODE_ID).unwrap(), root_inode());
        assert!(matches!(t.get(2), Err(FsError::NotFound)));
    }

    #[test]
    fn track_and_forget_refcounts() {
        let t = InodeTable::new(root_inode());
        t.track(5, dummy_inode()).unwrap();
        t.track(5, dummy_inode()).unwrap();
        t.track(5, dummy_inode()).unwrap();
        assert!(t.get(5).is_ok());

        t.forget(5, 2);
        assert!(t.get(5).is_ok());
        t.forget(5, 1);
        assert!(matches!(t.get(5), Err(FsError::NotFound)));
    }

    #[test]
    fn over_forget_is_nonfatal() {
        let t = InodeTable::new(root_inode());
        t.track(7, dummy_inode()).unwrap();
        t.forget(7, 100);
        assert!(matches!(t.get(7), Err(FsError::NotFound)));
        // forgetting an unknown node must not panic either
        t.forget(7, 1);
    }
}

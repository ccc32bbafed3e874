use crate::*;
use crate::store::{meta, unix_now, StoreInner};
use nix::fcntl::{flock, FlockArg};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Content beyond this stops accumulating in memory and spills to `temp/`.
pub const SPILL_THRESHOLD: usize = 64 * 1024;

pub(crate) struct SpillFile {
    pub file: File,
    pub path: PathBuf,
}

impl StoreInner {
    /// Create an exclusively-locked scratch file under `temp/`. The lock is
    /// what tells the collector the file is still owned by a live writer.
    pub(crate) fn create_temp_file(&self) -> FsResult<SpillFile> {
        loop {
            let fname: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect();
            let path = self.temp_dir().join(fname);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
                    return Ok(SpillFile { file, path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Accumulates one object's bytes and publishes them atomically on `close`.
///
/// The publish protocol makes a crash at any point recoverable: the
/// `temp_objects` row is inserted before any `data/` mutation, and the data
/// file reaches its final path by rename only. A writer dropped without
/// `close` deletes its own spill file; a writer that failed mid-publish
/// leaves it for the collector.
pub struct Writer {
    store: Arc<StoreInner>,
    deps: Vec<ObjectName>,
    digest: name::NameDigest,
    buf: Vec<u8>,
    spill: Option<SpillFile>,
    len: u64,
    lease_secs: i64,
    defused: bool,
}

impl Writer {
    pub(crate) fn new(store: Arc<StoreInner>, deps: Vec<ObjectName>, lease_secs: i64) -> Self {
        let digest = name::NameDigest::new(&deps);
        Self {
            store,
            deps,
            digest,
            buf: Vec::new(),
            spill: None,
            len: 0,
            lease_secs,
            defused: false,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write_all(&mut self, data: &[u8]) -> FsResult<()> {
        self.digest.update(data);
        self.len += data.len() as u64;

        if let Some(sp) = &mut self.spill {
            sp.file.write_all(data)?;
            return Ok(());
        }
        if self.buf.len() + data.len() > SPILL_THRESHOLD {
            let mut sp = self.store.create_temp_file()?;
            sp.file.write_all(&self.buf)?;
            sp.file.write_all(data)?;
            self.buf = Vec::new();
            self.spill = Some(sp);
        } else {
            self.buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Finalise the name and publish the object.
    ///
    /// If the name already exists this is the dedup fast path: the existing
    /// object's lease is extended and the scratch data is discarded. The
    /// returned name is identical either way.
    pub fn close(mut self) -> FsResult<ObjectName> {
        let name = self.digest.finalize();
        let lease_time = unix_now() + self.lease_secs;

        // From here on a failed publish leaves the spill file to the
        // collector instead of unlinking it on drop.
        self.defused = true;

        let store = self.store.clone();
        let mut spill = self.spill.take();
        let buf = std::mem::take(&mut self.buf);
        let deps = std::mem::take(&mut self.deps);

        let deduped = store.meta.with_write_txn(|conn| {
            let temp_id = meta::enqueue_temp_object(conn, &name)?;

            if meta::bump_lease(conn, &name, lease_time)? {
                meta::remove_temp_object(conn, temp_id)?;
                return Ok(true);
            }

            let id = meta::create_object(conn, &name, lease_time)?;
            for dep in &deps {
                let child =
                    meta::find_object_id(conn, dep)?.ok_or(FsError::DependencyMissing)?;
                meta::add_dep(conn, id, child)?;
            }

            let sp = match spill.take() {
                Some(sp) => sp,
                None => {
                    let mut sp = store.create_temp_file()?;
                    sp.file.write_all(&buf)?;
                    sp
                }
            };
            sp.file.sync_all()?;

            let dst = store.object_path(&name);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = fs::rename(&sp.path, &dst) {
                // a concurrent writer already published identical bytes
                if !dst.exists() {
                    return Err(e.into());
                }
                let _ = fs::remove_file(&sp.path);
            }

            meta::remove_temp_object(conn, temp_id)?;
            Ok(false)
        })?;

        if deduped {
            if let Some(sp) = spill {
                let _ = fs::remove_file(&sp.path);
            }
        }
        Ok(name)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.defused {
            if let Some(sp) = self.spill.take() {
                let _ = fs::remove_file(&sp.path);
            }
        }
    }
}

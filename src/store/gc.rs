use crate::*;
use crate::store::{meta, unix_now, Store};
use nix::fcntl::{flock, FlockArg};
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;

/// Upper bound on rows captured per transaction, so one pass never holds
/// the write lock for long.
pub const GC_BATCH: u64 = 256;

impl Store {
    /// Run the collector until nothing is left to reclaim or `budget` units
    /// of work (rows deleted plus files removed) have been spent.
    ///
    /// Returns `true` if a full pass completed within the budget, so
    /// incremental callers know whether to come back.
    pub fn garbage_collect(&self, budget: u64) -> FsResult<bool> {
        let mut work = 0u64;
        loop {
            let mut freed = 0u64;

            let limit = budget.saturating_sub(work);
            if limit == 0 {
                return Ok(false);
            }
            freed += self.collect_dead_objects(limit.min(GC_BATCH))?;

            let limit = budget.saturating_sub(work + freed);
            if limit == 0 {
                return Ok(false);
            }
            freed += self.collect_temp_rows(limit.min(GC_BATCH))?;

            let limit = budget.saturating_sub(work + freed);
            if limit == 0 {
                return Ok(false);
            }
            freed += self.sweep_temp_files(limit.min(GC_BATCH))?;

            work += freed;
            if freed == 0 {
                return Ok(true);
            }
            if work >= budget {
                return Ok(false);
            }
        }
    }

    /// Phase one: unreferenced objects with expired leases. Each victim's
    /// edges are dropped (decrementing the targets), its row is deleted,
    /// and its name is queued in `temp_objects` so phase two unlinks the
    /// data file.
    fn collect_dead_objects(&self, limit: u64) -> FsResult<u64> {
        let now = unix_now();
        self.inner().meta.with_write_txn(|conn| {
            let victims = meta::list_deleteable(conn, now, limit as usize)?;
            let mut freed = 0u64;
            for (id, name) in victims {
                meta::enqueue_temp_object(conn, &name)?;
                meta::delete_object(conn, id)?;
                freed += 1;
            }
            if freed > 0 {
                debug!("gc: retired {} objects", freed);
            }
            Ok(freed)
        })
    }

    /// Phase two: `temp_objects` rows. A name now owned by an object row is
    /// simply dropped; otherwise the data file is unlinked (missing files
    /// are tolerated) and the row dropped.
    fn collect_temp_rows(&self, limit: u64) -> FsResult<u64> {
        let inner = self.inner().clone();
        inner.meta.with_write_txn(|conn| {
            let rows = meta::list_temp_objects(conn, limit as usize)?;
            let mut freed = 0u64;
            for (temp_id, name) in rows {
                if meta::find_object_id(conn, &name)?.is_none() {
                    match fs::remove_file(inner.object_path(&name)) {
                        Ok(()) => freed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                meta::remove_temp_object(conn, temp_id)?;
                freed += 1;
            }
            Ok(freed)
        })
    }

    /// Phase three: scratch files under `temp/` whose writer is gone. A
    /// live writer holds an exclusive lock on its file; anything we can
    /// lock ourselves is debris.
    pub(crate) fn sweep_temp_files(&self, limit: u64) -> FsResult<u64> {
        let inner = self.inner().clone();
        inner.meta.with_write_txn(|_conn| {
            let mut freed = 0u64;
            let entries = match fs::read_dir(inner.temp_dir()) {
                Ok(it) => it,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                if freed >= limit {
                    break;
                }
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let path = entry.path();
                let file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                    Ok(()) => {}
                    Err(nix::Error::EAGAIN) => continue,
                    Err(e) => {
                        warn!("gc: lock probe of {:?} failed: {}", path, e);
                        continue;
                    }
                }
                match fs::remove_file(&path) {
                    Ok(()) => freed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(freed)
        })
    }
}

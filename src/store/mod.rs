pub mod gc;
pub mod meta;
pub mod writer;

pub use writer::Writer;

use crate::*;
use meta::MetaStore;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// How long a freshly written or touched object is protected from the
/// collector while nothing references it yet.
pub const DEFAULT_LEASE_SECS: i64 = 600;

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) struct StoreInner {
    pub(crate) root: PathBuf,
    pub(crate) meta: MetaStore,
}

impl StoreInner {
    pub(crate) fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub(crate) fn object_path(&self, name: &ObjectName) -> PathBuf {
        let hex = name.to_hex();
        self.data_dir().join(&hex[..2]).join(&hex[2..])
    }
}

/// A content-addressed object store rooted at one directory.
///
/// Layout: `metadata.sqlite` (objects, dependency edges, labels, in-flight
/// temp names), `data/<aa>/<rest-of-hex>` immutable blobs, `temp/` scratch
/// files owned by live writers.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(root: &Path) -> FsResult<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("temp"))?;
        let meta = MetaStore::open(&root.join("metadata.sqlite"))?;
        let store = Store {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                meta,
            }),
        };

        // reclaim scratch files left behind by crashed writers
        match store.sweep_temp_files(u64::MAX) {
            Ok(n) if n > 0 => info!("reclaimed {} orphan temp files", n),
            Ok(_) => {}
            Err(e) => warn!("temp sweep on open failed: {}", e),
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn session(&self) -> Session {
        self.session_with_lease(DEFAULT_LEASE_SECS)
    }

    pub fn session_with_lease(&self, lease_secs: i64) -> Session {
        Session {
            inner: self.inner.clone(),
            lease_secs,
        }
    }

    /// Point `(namespace, label)` at an object, replacing any old target.
    pub fn set_label(&self, namespace: &str, label: &str, name: &ObjectName) -> FsResult<()> {
        self.inner.meta.with_write_txn(|conn| {
            let id = meta::find_object_id(conn, name)?.ok_or(FsError::NotFound)?;
            meta::set_label(conn, namespace, label, Some(id))
        })
    }

    pub fn delete_label(&self, namespace: &str, label: &str) -> FsResult<()> {
        self.inner
            .meta
            .with_write_txn(|conn| meta::set_label(conn, namespace, label, None))
    }

    pub fn get_label(&self, namespace: &str, label: &str) -> FsResult<Option<ObjectName>> {
        self.inner
            .meta
            .with_conn(|conn| Ok(meta::get_label(conn, namespace, label)?.map(|(_, n)| n)))
    }

    pub fn list_labels(&self, namespace: &str) -> FsResult<Vec<(String, ObjectName)>> {
        self.inner
            .meta
            .with_conn(|conn| meta::list_labels(conn, namespace))
    }

    /// Open an object's data file for positional reads. An `objects` row
    /// observed by the caller guarantees the file exists.
    pub fn open_object(&self, name: &ObjectName) -> FsResult<File> {
        match File::open(self.inner.object_path(name)) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_object(&self, name: &ObjectName) -> FsResult<Vec<u8>> {
        match fs::read(self.inner.object_path(name)) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub fn object_len(&self, name: &ObjectName) -> FsResult<u64> {
        match fs::metadata(self.inner.object_path(name)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, name: &ObjectName) -> bool {
        self.inner.object_path(name).exists()
    }

    /// Re-hash an object's bytes together with its recorded dependencies
    /// and compare against its name.
    pub fn verify_object(&self, name: &ObjectName) -> FsResult<bool> {
        let content = self.read_object(name)?;
        let deps = self.inner.meta.with_conn(|conn| {
            let id = meta::find_object_id(conn, name)?.ok_or(FsError::NotFound)?;
            meta::dep_names(conn, id)
        })?;
        Ok(name::compute_name(&content, &deps) == *name)
    }

    pub fn stats(&self) -> FsResult<StoreStats> {
        let mut stats = StoreStats::default();
        let data = self.inner.data_dir();
        if !data.exists() {
            return Ok(stats);
        }
        for shard in fs::read_dir(&data)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for blob in fs::read_dir(shard.path())? {
                let blob = blob?;
                if blob.file_type()?.is_file() {
                    stats.objects += 1;
                    stats.total_bytes += blob.metadata()?.len();
                }
            }
        }
        Ok(stats)
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: u64,
    pub total_bytes: u64,
}

/// A scope of short-lived leases protecting freshly created objects until
/// they are committed to a label or a parent. Closing a session is a no-op;
/// protection simply lapses when the leases expire.
#[derive(Clone)]
pub struct Session {
    inner: Arc<StoreInner>,
    lease_secs: i64,
}

impl Session {
    pub fn writer(&self, deps: &[ObjectName]) -> Writer {
        Writer::new(self.inner.clone(), deps.to_vec(), self.lease_secs)
    }

    pub fn put_object(&self, data: &[u8], deps: &[ObjectName]) -> FsResult<ObjectName> {
        let mut w = self.writer(deps);
        w.write_all(data)?;
        w.close()
    }

    /// Extend the lease of an existing object.
    pub fn touch(&self, name: &ObjectName) -> FsResult<()> {
        let lease_time = unix_now() + self.lease_secs;
        self.inner.meta.with_write_txn(|conn| {
            if meta::bump_lease(conn, name, lease_time)? {
                Ok(())
            } else {
                Err(FsError::NotFound)
            }
        })
    }

    /// Resolve a label and extend the target's lease so it outlives the
    /// session even if the label is repointed meanwhile.
    pub fn get_label(&self, namespace: &str, label: &str) -> FsResult<Option<ObjectName>> {
        let lease_time = unix_now() + self.lease_secs;
        self.inner.meta.with_write_txn(|conn| {
            match meta::get_label(conn, namespace, label)? {
                Some((id, name)) => {
                    meta::touch_lease(conn, id, lease_time)?;
                    Ok(Some(name))
                }
                None => Ok(None),
            }
        })
    }
}

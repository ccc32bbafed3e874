use crate::*;
use crate::fs::codec::{self, DirHeader};
use crate::fs::DirEntry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, RwLock};

/// A server-side resource bound to one opened node.
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

/// Open regular file. Reads are positional, so concurrent `Read` requests
/// on the same handle need no coordination.
pub struct FileHandle {
    file: File,
}

impl FileHandle {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn read_at(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(done);
        Ok(buf)
    }
}

struct DirCursor {
    file: File,
    /// index of the record the file is positioned at
    index: u64,
}

/// Open directory blob. The decode cursor is guarded by a mutex; racing
/// readdir calls on one handle would otherwise tear the seek position.
pub struct DirHandle {
    header: DirHeader,
    cursor: Mutex<DirCursor>,
}

impl DirHandle {
    pub fn open(mut file: File) -> FsResult<Self> {
        file.seek(SeekFrom::Start(0))?;
        let header = codec::read_header(&mut file)?;
        if header.count > 0 {
            let (off, _) = codec::read_index_entry(&mut file, 0)?;
            file.seek(SeekFrom::Start(off as u64))?;
        }
        Ok(Self {
            header,
            cursor: Mutex::new(DirCursor { file, index: 0 }),
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.header.count
    }

    /// Decode record `index`, seeking through the offset table only when
    /// the kernel jumped away from the sequential position.
    pub fn read_entry_at(&self, index: u64) -> FsResult<Option<DirEntry>> {
        if index >= self.header.count as u64 {
            return Ok(None);
        }
        let mut cur = mutex_lock!(self.cursor);
        if cur.index != index {
            let (off, _) = codec::read_index_entry(&mut cur.file, index as u32)?;
            cur.file.seek(SeekFrom::Start(off as u64))?;
            cur.index = index;
        }
        let entry = codec::read_record(&mut cur.file)?;
        cur.index += 1;
        Ok(Some(entry))
    }
}

struct HandleMap {
    map: HashMap<u64, Arc<Handle>>,
    last_id: u64,
}

/// Registry of open handles; ids are monotonic under the write lock.
pub struct HandleTable {
    inner: RwLock<HandleMap>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HandleMap {
                map: HashMap::new(),
                last_id: 0,
            }),
        }
    }

    pub fn insert(&self, handle: Handle) -> FsResult<u64> {
        let mut inner = rwlock_write!(self.inner);
        inner.last_id += 1;
        let id = inner.last_id;
        inner.map.insert(id, Arc::new(handle));
        Ok(id)
    }

    pub fn get(&self, id: u64) -> FsResult<Arc<Handle>> {
        let inner = rwlock_read!(self.inner);
        inner.map.get(&id).cloned().ok_or(FsError::BadHandle)
    }

    pub fn remove(&self, id: u64) -> FsResult<()> {
        let mut inner = rwlock_write!(self.inner);
        inner.map.remove(&id).map(|_| ()).ok_or(FsError::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.map.len()).unwrap_or(0)
    }
}

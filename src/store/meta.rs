use crate::*;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// current on-disk schema version
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS version (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name BLOB NOT NULL UNIQUE,
    ref_count INTEGER NOT NULL DEFAULT 0,
    lease_time INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS object_deps (
    parent_id INTEGER NOT NULL,
    child_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS object_deps_parent ON object_deps (parent_id);
CREATE INDEX IF NOT EXISTS object_deps_child ON object_deps (child_id);
CREATE TABLE IF NOT EXISTS labels (
    namespace TEXT NOT NULL,
    label TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    PRIMARY KEY (namespace, label)
);
CREATE TABLE IF NOT EXISTS temp_objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name BLOB NOT NULL
);
";

/// Transactional metadata tables behind the store.
///
/// All mutation of `data/` happens while `with_write_txn` holds the
/// connection's IMMEDIATE transaction, which is what serialises writers
/// against the collector.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    pub fn open(path: &Path) -> FsResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM version", [], |r| r.get(0))
            .optional()?;
        match version {
            None => {
                conn.execute("INSERT INTO version (version) VALUES (?1)", [SCHEMA_VERSION])?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(_) => return Err(FsError::VersionMismatch),
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. The transaction is
    /// committed iff `f` returns `Ok`; any error rolls the whole batch back.
    pub fn with_write_txn<T, F>(&self, f: F) -> FsResult<T>
    where
        F: FnOnce(&Connection) -> FsResult<T>,
    {
        let mut conn = mutex_lock!(self.conn);
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Run a read-only batch outside any write transaction.
    pub fn with_conn<T, F>(&self, f: F) -> FsResult<T>
    where
        F: FnOnce(&Connection) -> FsResult<T>,
    {
        let conn = mutex_lock!(self.conn);
        f(&conn)
    }
}

fn name_column(raw: Vec<u8>) -> FsResult<ObjectName> {
    ObjectName::from_slice(&raw)
}

pub fn find_object_id(conn: &Connection, name: &ObjectName) -> FsResult<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM objects WHERE name = ?1",
            [name.as_bytes().as_slice()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn object_name(conn: &Connection, id: i64) -> FsResult<Option<ObjectName>> {
    let raw: Option<Vec<u8>> = conn
        .query_row("SELECT name FROM objects WHERE id = ?1", [id], |r| r.get(0))
        .optional()?;
    raw.map(name_column).transpose()
}

/// Insert a fresh object row with `ref_count = 0`; fails if the name exists.
pub fn create_object(conn: &Connection, name: &ObjectName, lease_time: i64) -> FsResult<i64> {
    conn.execute(
        "INSERT INTO objects (name, ref_count, lease_time) VALUES (?1, 0, ?2)",
        rusqlite::params![name.as_bytes().as_slice(), lease_time],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Extend the lease of an existing object. Returns whether a row was
/// touched, which doubles as the writer's dedup existence probe.
pub fn bump_lease(conn: &Connection, name: &ObjectName, lease_time: i64) -> FsResult<bool> {
    let n = conn.execute(
        "UPDATE objects SET lease_time = MAX(?1, lease_time + 1) WHERE name = ?2",
        rusqlite::params![lease_time, name.as_bytes().as_slice()],
    )?;
    Ok(n > 0)
}

pub fn touch_lease(conn: &Connection, id: i64, lease_time: i64) -> FsResult<()> {
    conn.execute(
        "UPDATE objects SET lease_time = MAX(?1, lease_time + 1) WHERE id = ?2",
        rusqlite::params![lease_time, id],
    )?;
    Ok(())
}

/// Record a dependency edge and bump the child's reference count. Duplicate
/// edges are kept; the count tracks edges exactly.
pub fn add_dep(conn: &Connection, parent_id: i64, child_id: i64) -> FsResult<()> {
    conn.execute(
        "INSERT INTO object_deps (parent_id, child_id) VALUES (?1, ?2)",
        [parent_id, child_id],
    )?;
    conn.execute(
        "UPDATE objects SET ref_count = ref_count + 1 WHERE id = ?1",
        [child_id],
    )?;
    Ok(())
}

pub fn dep_names(conn: &Connection, parent_id: i64) -> FsResult<Vec<ObjectName>> {
    let mut stmt = conn.prepare(
        "SELECT o.name FROM object_deps d JOIN objects o ON o.id = d.child_id
         WHERE d.parent_id = ?1",
    )?;
    let rows = stmt.query_map([parent_id], |r| r.get::<_, Vec<u8>>(0))?;
    let mut out = Vec::new();
    for raw in rows {
        out.push(name_column(raw?)?);
    }
    Ok(out)
}

/// Objects with no references and an expired lease, oldest ids first.
pub fn list_deleteable(conn: &Connection, now: i64, limit: usize) -> FsResult<Vec<(i64, ObjectName)>> {
    let mut stmt = conn.prepare(
        "SELECT id, name FROM objects WHERE ref_count = 0 AND lease_time < ?1
         ORDER BY id LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![now, limit as i64], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, raw) = row?;
        out.push((id, name_column(raw)?));
    }
    Ok(out)
}

/// Drop an object row and its outgoing edges, decrementing every edge
/// target once per edge.
pub fn delete_object(conn: &Connection, id: i64) -> FsResult<()> {
    let mut stmt = conn.prepare("SELECT child_id FROM object_deps WHERE parent_id = ?1")?;
    let children: Vec<i64> = stmt
        .query_map([id], |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    for child in children {
        conn.execute(
            "UPDATE objects SET ref_count = ref_count - 1 WHERE id = ?1",
            [child],
        )?;
    }
    conn.execute("DELETE FROM object_deps WHERE parent_id = ?1", [id])?;
    conn.execute("DELETE FROM objects WHERE id = ?1", [id])?;
    Ok(())
}

pub fn enqueue_temp_object(conn: &Connection, name: &ObjectName) -> FsResult<i64> {
    conn.execute(
        "INSERT INTO temp_objects (name) VALUES (?1)",
        [name.as_bytes().as_slice()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn remove_temp_object(conn: &Connection, temp_id: i64) -> FsResult<()> {
    conn.execute("DELETE FROM temp_objects WHERE id = ?1", [temp_id])?;
    Ok(())
}

pub fn list_temp_objects(conn: &Connection, limit: usize) -> FsResult<Vec<(i64, ObjectName)>> {
    let mut stmt = conn.prepare("SELECT id, name FROM temp_objects ORDER BY id LIMIT ?1")?;
    let rows = stmt.query_map([limit as i64], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, raw) = row?;
        out.push((id, name_column(raw)?));
    }
    Ok(out)
}

/// Atomically repoint `(namespace, label)`, fixing up the reference counts
/// of the old and new targets. `None` removes the label.
pub fn set_label(
    conn: &Connection,
    namespace: &str,
    label: &str,
    object_id: Option<i64>,
) -> FsResult<()> {
    let old: Option<i64> = conn
        .query_row(
            "SELECT object_id FROM labels WHERE namespace = ?1 AND label = ?2",
            [namespace, label],
            |r| r.get(0),
        )
        .optional()?;

    match object_id {
        Some(new_id) => {
            conn.execute(
                "INSERT INTO labels (namespace, label, object_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT (namespace, label) DO UPDATE SET object_id = ?3",
                rusqlite::params![namespace, label, new_id],
            )?;
            conn.execute(
                "UPDATE objects SET ref_count = ref_count + 1 WHERE id = ?1",
                [new_id],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM labels WHERE namespace = ?1 AND label = ?2",
                [namespace, label],
            )?;
        }
    }
    if let Some(old_id) = old {
        conn.execute(
            "UPDATE objects SET ref_count = ref_count - 1 WHERE id = ?1",
            [old_id],
        )?;
    }
    Ok(())
}

pub fn get_label(
    conn: &Connection,
    namespace: &str,
    label: &str,
) -> FsResult<Option<(i64, ObjectName)>> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT o.id, o.name FROM labels l JOIN objects o ON o.id = l.object_id
             WHERE l.namespace = ?1 AND l.label = ?2",
            [namespace, label],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((id, raw)) => Ok(Some((id, name_column(raw)?))),
        None => Ok(None),
    }
}

pub fn list_labels(conn: &Connection, namespace: &str) -> FsResult<Vec<(String, ObjectName)>> {
    let mut stmt = conn.prepare(
        "SELECT l.label, o.name FROM labels l JOIN objects o ON o.id = l.object_id
         WHERE l.namespace = ?1 ORDER BY l.label",
    )?;
    let rows = stmt.query_map([namespace], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (label, raw) = row?;
        out.push((label, name_column(raw)?));
    }
    Ok(out)
}

pub fn ref_count(conn: &Connection, id: i64) -> FsResult<Option<i64>> {
    let n = conn
        .query_row("SELECT ref_count FROM objects WHERE id = ?1", [id], |r| r.get(0))
        .optional()?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_meta(dir: &TempDir) -> MetaStore {
        MetaStore::open(&dir.path().join("metadata.sqlite")).unwrap()
    }

    #[test]
    fn version_handshake() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.sqlite");
        drop(MetaStore::open(&path).unwrap());
        // reopen is fine
        drop(MetaStore::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE version SET version = 99", []).unwrap();
        drop(conn);
        assert!(matches!(MetaStore::open(&path), Err(FsError::VersionMismatch)));
    }

    #[test]
    fn dep_edges_track_ref_counts() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);
        let child = name::compute_name(b"child", &[]);
        let parent = name::compute_name(b"parent", &[child]);

        meta.with_write_txn(|conn| {
            let cid = create_object(conn, &child, 100)?;
            let pid = create_object(conn, &parent, 100)?;
            add_dep(conn, pid, cid)?;
            add_dep(conn, pid, cid)?;
            assert_eq!(ref_count(conn, cid)?, Some(2));
            delete_object(conn, pid)?;
            assert_eq!(ref_count(conn, cid)?, Some(0));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn label_swap_fixes_both_targets() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);
        let a = name::compute_name(b"a", &[]);
        let b = name::compute_name(b"b", &[]);

        meta.with_write_txn(|conn| {
            let aid = create_object(conn, &a, 100)?;
            let bid = create_object(conn, &b, 100)?;

            set_label(conn, "ns", "foo", Some(aid))?;
            assert_eq!(ref_count(conn, aid)?, Some(1));

            set_label(conn, "ns", "foo", Some(bid))?;
            assert_eq!(ref_count(conn, aid)?, Some(0));
            assert_eq!(ref_count(conn, bid)?, Some(1));
            assert_eq!(get_label(conn, "ns", "foo")?.map(|(_, n)| n), Some(b));

            set_label(conn, "ns", "foo", None)?;
            assert_eq!(ref_count(conn, bid)?, Some(0));
            assert_eq!(get_label(conn, "ns", "foo")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn rollback_on_error() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);
        let a = name::compute_name(b"a", &[]);

        let res: FsResult<()> = meta.with_write_txn(|conn| {
            create_object(conn, &a, 100)?;
            Err(FsError::NotFound)
        });
        assert!(res.is_err());
        meta.with_conn(|conn| {
            assert_eq!(find_object_id(conn, &a)?, None);
            Ok(())
        })
        .unwrap();
    }
}

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    ops::{Bound, ControlFlow},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SerieslyError};

/// File extension for database files under the root directory.
pub const DB_EXT: &str = "series";

const OP_SET: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_COMMIT: u8 = 3;

// op + klen + vlen + crc
const FRAME_OVERHEAD: usize = 1 + 4 + 4 + 4;
const MAX_FRAME: u32 = 1 << 30;

/// Snapshot of a database file's vitals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    pub last_seq: u64,
    pub doc_count: u64,
    pub deleted_count: u64,
    pub space_used: u64,
    pub header_pos: u64,
}

#[derive(Debug, Clone, Copy)]
struct DocLocation {
    offset: u64,
    len: u32,
}

enum StagedOp {
    Set(String, DocLocation),
    Delete(String),
}

/// A single-file log-structured document store.
///
/// The file is a stream of crc-checked frames (set, delete, commit). Ops
/// become visible only once a commit frame lands, so a reader opening the
/// file mid-write sees the last committed state and a torn tail is ignored
/// on the next open.
pub struct Store {
    path: PathBuf,
    file: Mutex<File>,
    index: Mutex<BTreeMap<String, DocLocation>>,
    last_seq: AtomicU64,
    deleted_count: AtomicU64,
    header_pos: AtomicU64,
    committed_size: AtomicU64,
}

impl Store {
    pub fn open(path: &Path, create_if_missing: bool) -> Result<Store> {
        if !create_if_missing && !path.exists() {
            return Err(SerieslyError::StoreOpen(format!(
                "no database at {}",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)
            .map_err(|err| SerieslyError::StoreOpen(err.to_string()))?;

        let mut store = Store {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index: Mutex::new(BTreeMap::new()),
            last_seq: AtomicU64::new(0),
            deleted_count: AtomicU64::new(0),
            header_pos: AtomicU64::new(0),
            committed_size: AtomicU64::new(0),
        };
        store.recover()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans the frame stream up to the last valid commit, rebuilding the
    /// key index.
    fn recover(&mut self) -> Result<()> {
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);

        let mut offset = 0u64;
        let mut staged: Vec<StagedOp> = Vec::new();
        let index = self.index.get_mut();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(_) => break,
            }
            let frame_len = u32::from_le_bytes(len_buf);
            if frame_len < FRAME_OVERHEAD as u32 || frame_len > MAX_FRAME {
                break;
            }
            let mut frame = vec![0u8; frame_len as usize];
            if reader.read_exact(&mut frame).is_err() {
                break;
            }

            let body = &frame[..frame.len() - 4];
            let stored_crc =
                u32::from_le_bytes(frame[frame.len() - 4..].try_into().expect("crc tail"));
            if crc32fast::hash(body) != stored_crc {
                break;
            }

            let op = body[0];
            let klen = u32::from_le_bytes(body[1..5].try_into().expect("klen")) as usize;
            if 5 + klen + 4 > body.len() {
                break;
            }
            let key = match std::str::from_utf8(&body[5..5 + klen]) {
                Ok(k) => k.to_string(),
                Err(_) => break,
            };
            let vlen =
                u32::from_le_bytes(body[5 + klen..9 + klen].try_into().expect("vlen")) as usize;
            if 9 + klen + vlen != body.len() {
                break;
            }

            match op {
                OP_SET => {
                    let value_offset = offset + 4 + 9 + klen as u64;
                    staged.push(StagedOp::Set(
                        key,
                        DocLocation {
                            offset: value_offset,
                            len: vlen as u32,
                        },
                    ));
                }
                OP_DELETE => staged.push(StagedOp::Delete(key)),
                OP_COMMIT => {
                    let applied = staged.len() as u64;
                    for item in staged.drain(..) {
                        match item {
                            StagedOp::Set(k, loc) => {
                                index.insert(k, loc);
                            }
                            StagedOp::Delete(k) => {
                                if index.remove(&k).is_some() {
                                    self.deleted_count.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                    self.last_seq.fetch_add(applied, Ordering::Relaxed);
                    let end = offset + 4 + frame_len as u64;
                    self.header_pos.store(end, Ordering::Relaxed);
                    self.committed_size.store(end, Ordering::Relaxed);
                }
                _ => break,
            }

            offset += 4 + frame_len as u64;
        }

        Ok(())
    }

    /// Point get by exact key.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let loc = match self.index.lock().get(key) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        Ok(Some(self.read_value(loc)?))
    }

    fn read_value(&self, loc: DocLocation) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Walks `[from, to)` in ascending key order. An empty bound is
    /// unbounded on that side. The visitor may stop the walk early with
    /// `ControlFlow::Break`.
    pub fn walk_range<F>(&self, from: &str, to: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, Vec<u8>) -> Result<ControlFlow<()>>,
    {
        let entries: Vec<(String, DocLocation)> = {
            let index = self.index.lock();
            let lower = if from.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Included(from.to_string())
            };
            let upper = if to.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Excluded(to.to_string())
            };
            index
                .range((lower, upper))
                .map(|(k, loc)| (k.clone(), *loc))
                .collect()
        };

        for (key, loc) in entries {
            let value = self
                .read_value(loc)
                .map_err(|err| SerieslyError::StoreWalk(err.to_string()))?;
            if visit(&key, value)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn apply_batch(&self, ops: &[BulkOp]) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }

        let mut file = self.file.lock();
        let base = self.committed_size.load(Ordering::Relaxed);
        // Drop any torn tail from an earlier failed append.
        file.set_len(base)
            .map_err(|err| SerieslyError::StoreWrite(err.to_string()))?;
        file.seek(SeekFrom::Start(base))
            .map_err(|err| SerieslyError::StoreWrite(err.to_string()))?;

        let mut offset = base;
        let mut set_locations: Vec<DocLocation> = Vec::new();
        let mut buf = BytesMut::new();
        for op in ops {
            let frame = match op {
                BulkOp::Set(key, value) => {
                    set_locations.push(DocLocation {
                        offset: offset + 4 + 9 + key.len() as u64,
                        len: value.len() as u32,
                    });
                    encode_frame(OP_SET, key.as_bytes(), value)
                }
                BulkOp::Delete(key) => encode_frame(OP_DELETE, key.as_bytes(), &[]),
            };
            offset += frame.len() as u64;
            buf.extend_from_slice(&frame);
        }
        let commit = encode_frame(OP_COMMIT, &[], &[]);
        offset += commit.len() as u64;
        buf.extend_from_slice(&commit);

        file.write_all(&buf)
            .map_err(|err| SerieslyError::StoreWrite(err.to_string()))?;
        file.sync_data()
            .map_err(|err| SerieslyError::StoreWrite(err.to_string()))?;
        drop(file);

        let mut index = self.index.lock();
        let mut locations = set_locations.into_iter();
        for op in ops {
            match op {
                BulkOp::Set(key, _) => {
                    let loc = locations.next().expect("location recorded per set op");
                    index.insert(key.clone(), loc);
                }
                BulkOp::Delete(key) => {
                    if index.remove(key).is_some() {
                        self.deleted_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        drop(index);

        self.last_seq.fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.header_pos.store(offset, Ordering::Relaxed);
        self.committed_size.store(offset, Ordering::Relaxed);
        Ok(ops.len())
    }

    /// Writes the surviving documents to `dest` under a single commit.
    pub fn compact_to(&self, dest: &Path) -> Result<()> {
        let entries: Vec<(String, DocLocation)> = self
            .index
            .lock()
            .iter()
            .map(|(k, loc)| (k.clone(), *loc))
            .collect();

        let mut out = File::create(dest).map_err(|err| {
            SerieslyError::CompactFailed(format!("create {}: {err}", dest.display()))
        })?;

        let mut buf = BytesMut::new();
        for (key, loc) in entries {
            let value = self
                .read_value(loc)
                .map_err(|err| SerieslyError::CompactFailed(err.to_string()))?;
            buf.extend_from_slice(&encode_frame(OP_SET, key.as_bytes(), &value));
        }
        buf.extend_from_slice(&encode_frame(OP_COMMIT, &[], &[]));

        out.write_all(&buf)
            .and_then(|_| out.sync_all())
            .map_err(|err| SerieslyError::CompactFailed(err.to_string()))?;
        Ok(())
    }

    pub fn info(&self) -> DbInfo {
        DbInfo {
            last_seq: self.last_seq.load(Ordering::Relaxed),
            doc_count: self.index.lock().len() as u64,
            deleted_count: self.deleted_count.load(Ordering::Relaxed),
            space_used: self.committed_size.load(Ordering::Relaxed),
            header_pos: self.header_pos.load(Ordering::Relaxed),
        }
    }
}

enum BulkOp {
    Set(String, Vec<u8>),
    Delete(String),
}

/// Batches sets and deletes; nothing is visible until `commit`. The caller
/// is expected to be the single writing owner of the handle.
pub struct BulkWriter {
    store: Arc<Store>,
    ops: Vec<BulkOp>,
}

impl BulkWriter {
    pub fn new(store: Arc<Store>) -> BulkWriter {
        BulkWriter {
            store,
            ops: Vec::new(),
        }
    }

    pub fn set(&mut self, key: String, value: Vec<u8>) {
        self.ops.push(BulkOp::Set(key, value));
    }

    pub fn delete(&mut self, key: String) {
        self.ops.push(BulkOp::Delete(key));
    }

    pub fn queued(&self) -> usize {
        self.ops.len()
    }

    /// Appends the batch plus a commit frame and syncs. The batch is
    /// cleared even on failure; a failed commit leaves no partial state
    /// visible.
    pub fn commit(&mut self) -> Result<usize> {
        let ops = std::mem::take(&mut self.ops);
        self.store.apply_batch(&ops)
    }
}

fn encode_frame(op: u8, key: &[u8], value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + FRAME_OVERHEAD + key.len() + value.len());
    buf.put_u32_le(0);
    buf.put_u8(op);
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
    let crc = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(crc);
    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<Store> {
        let path = dir.path().join(format!("test.{DB_EXT}"));
        Arc::new(Store::open(&path, true).unwrap())
    }

    fn collect_all(store: &Store) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        store
            .walk_range("", "", |k, v| {
                out.push((k.to_string(), v));
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        out
    }

    #[test]
    fn set_commit_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut bulk = BulkWriter::new(Arc::clone(&store));
        bulk.set("a".into(), b"1".to_vec());
        bulk.set("b".into(), b"2".to_vec());
        assert_eq!(bulk.commit().unwrap(), 2);

        assert_eq!(store.get("a").unwrap().unwrap(), b"1");
        assert_eq!(store.get("b").unwrap().unwrap(), b"2");
        assert!(store.get("c").unwrap().is_none());
    }

    #[test]
    fn deletes_survive_and_walk_is_ordered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut bulk = BulkWriter::new(Arc::clone(&store));
        for key in ["c", "a", "d", "b"] {
            bulk.set(key.into(), key.as_bytes().to_vec());
        }
        bulk.commit().unwrap();
        bulk.delete("c".into());
        bulk.commit().unwrap();

        let all = collect_all(&store);
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "d"]);
    }

    #[test]
    fn uncommitted_ops_are_invisible_to_a_fresh_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("test.{DB_EXT}"));
        let store = Arc::new(Store::open(&path, true).unwrap());

        let mut bulk = BulkWriter::new(Arc::clone(&store));
        bulk.set("a".into(), b"1".to_vec());
        bulk.commit().unwrap();
        bulk.set("b".into(), b"2".to_vec());
        // no commit for "b"

        let reader = Store::open(&path, false).unwrap();
        assert!(reader.get("a").unwrap().is_some());
        assert!(reader.get("b").unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("test.{DB_EXT}"));
        {
            let store = Arc::new(Store::open(&path, true).unwrap());
            let mut bulk = BulkWriter::new(Arc::clone(&store));
            bulk.set("x".into(), b"{\"v\":1}".to_vec());
            bulk.set("y".into(), b"{\"v\":2}".to_vec());
            bulk.commit().unwrap();
            bulk.delete("x".into());
            bulk.commit().unwrap();
        }

        let store = Store::open(&path, false).unwrap();
        assert!(store.get("x").unwrap().is_none());
        assert_eq!(store.get("y").unwrap().unwrap(), b"{\"v\":2}");
        let info = store.info();
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.deleted_count, 1);
        assert_eq!(info.last_seq, 3);
    }

    #[test]
    fn walk_respects_bounds_and_early_stop() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut bulk = BulkWriter::new(Arc::clone(&store));
        for key in ["a", "b", "c", "d", "e"] {
            bulk.set(key.into(), vec![]);
        }
        bulk.commit().unwrap();

        let mut seen = Vec::new();
        store
            .walk_range("b", "e", |k, _| {
                seen.push(k.to_string());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(seen, vec!["b", "c", "d"]);

        let mut seen = Vec::new();
        store
            .walk_range("", "", |k, _| {
                seen.push(k.to_string());
                Ok(if seen.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn compaction_drops_dead_space() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("test.{DB_EXT}"));
        let store = Arc::new(Store::open(&path, true).unwrap());

        let mut bulk = BulkWriter::new(Arc::clone(&store));
        for i in 0..100 {
            bulk.set(format!("key-{i:03}"), vec![b'x'; 64]);
        }
        bulk.commit().unwrap();
        // Overwrite everything once to create garbage.
        for i in 0..100 {
            bulk.set(format!("key-{i:03}"), vec![b'y'; 64]);
        }
        bulk.commit().unwrap();

        let before = store.info();
        let compact_path = dir.path().join(format!("test.{DB_EXT}.compact"));
        store.compact_to(&compact_path).unwrap();

        let compacted = Store::open(&compact_path, false).unwrap();
        let info = compacted.info();
        assert_eq!(info.doc_count, before.doc_count);
        assert!(info.space_used <= before.space_used);
        assert_eq!(compacted.get("key-007").unwrap().unwrap(), vec![b'y'; 64]);
    }
}

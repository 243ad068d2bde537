//! Component A: the abstract key-value backend (spec.md §4.A) and its two
//! implementations — a real `redis`-backed client and an in-memory double
//! used by tests.

use std::cell::RefCell;
use std::collections::HashMap;

use redis::Commands;

use crate::config::NamespaceAddr;
use crate::error::FsError;

/// A single key-value namespace: put (assign-or-replace), get, delete, scan.
///
/// `put` mirrors the zdb primitive exactly: passing `key = None` asks the
/// backend to assign a fresh id and return it; passing `Some(id)` replaces
/// the record at that id (creating it if absent).
pub trait Backend {
    fn put(&self, key: Option<u32>, value: &[u8]) -> Result<u32, FsError>;
    fn get(&self, key: u32) -> Result<Option<Vec<u8>>, FsError>;
    fn del(&self, key: u32) -> Result<(), FsError>;
    fn scan(&self, cursor: u32) -> Result<(u32, Vec<u32>), FsError>;

    /// Raises the namespace's id allocator so the next key-less `put`
    /// returns something strictly greater than `floor`. Called at mount
    /// time once the highest key in use has been found by scanning, so a
    /// freshly assigned id never collides with an existing record (in
    /// particular, never reassigns `ROOT_INO`).
    fn bootstrap_allocator(&self, floor: u32) -> Result<(), FsError>;
}

/// A real connection to a zdb-compatible namespace, reached over the RESP
/// protocol via the `redis` crate.
pub struct RedisBackend {
    conn: RefCell<redis::Connection>,
    counter_key: String,
}

impl RedisBackend {
    pub fn connect(addr: &NamespaceAddr, counter_key: &str) -> Result<Self, FsError> {
        let info = if let Some(path) = &addr.unix {
            redis::ConnectionInfo {
                addr: redis::ConnectionAddr::Unix(path.into()),
                redis: Self::redis_info(addr),
            }
        } else {
            redis::ConnectionInfo {
                addr: redis::ConnectionAddr::Tcp(addr.host.clone(), addr.port),
                redis: Self::redis_info(addr),
            }
        };
        let client = redis::Client::open(info)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: RefCell::new(conn),
            counter_key: counter_key.to_string(),
        })
    }

    fn redis_info(addr: &NamespaceAddr) -> redis::RedisConnectionInfo {
        redis::RedisConnectionInfo {
            db: 0,
            username: None,
            password: addr.password.clone(),
            protocol: redis::ProtocolVersion::RESP2,
        }
    }
}

impl Backend for RedisBackend {
    fn put(&self, key: Option<u32>, value: &[u8]) -> Result<u32, FsError> {
        let mut conn = self.conn.borrow_mut();
        let id = match key {
            Some(id) => id,
            // zdb's SET-with-no-key assigns the next free id; a Redis INCR
            // on a per-namespace counter is the closest atomic equivalent.
            None => conn.incr(&self.counter_key, 1u32)?,
        };
        let _: () = conn.set(id, value)?;
        Ok(id)
    }

    fn get(&self, key: u32) -> Result<Option<Vec<u8>>, FsError> {
        let mut conn = self.conn.borrow_mut();
        let value: Option<Vec<u8>> = conn.get(key)?;
        Ok(value)
    }

    fn del(&self, key: u32) -> Result<(), FsError> {
        let mut conn = self.conn.borrow_mut();
        let _: () = conn.del(key)?;
        Ok(())
    }

    fn scan(&self, cursor: u32) -> Result<(u32, Vec<u32>), FsError> {
        let mut conn = self.conn.borrow_mut();
        let (next, keys): (u32, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .query(&mut *conn)
            .map_err(FsError::from)?;
        let keys = keys.iter().filter_map(|k| k.parse().ok()).collect();
        Ok((next, keys))
    }

    fn bootstrap_allocator(&self, floor: u32) -> Result<(), FsError> {
        let mut conn = self.conn.borrow_mut();
        let current: Option<u32> = conn.get(&self.counter_key)?;
        if current.unwrap_or(0) < floor {
            let _: () = conn.set(&self.counter_key, floor)?;
        }
        Ok(())
    }
}

/// Test double standing in for a zdb connection: three plain maps, no I/O.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RefCell<MemoryBackendInner>,
}

#[derive(Default)]
struct MemoryBackendInner {
    store: HashMap<u32, Vec<u8>>,
    next_id: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn put(&self, key: Option<u32>, value: &[u8]) -> Result<u32, FsError> {
        let mut inner = self.inner.borrow_mut();
        let id = match key {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                inner.next_id
            }
        };
        inner.store.insert(id, value.to_vec());
        Ok(id)
    }

    fn get(&self, key: u32) -> Result<Option<Vec<u8>>, FsError> {
        Ok(self.inner.borrow().store.get(&key).cloned())
    }

    fn del(&self, key: u32) -> Result<(), FsError> {
        self.inner.borrow_mut().store.remove(&key);
        Ok(())
    }

    fn scan(&self, cursor: u32) -> Result<(u32, Vec<u32>), FsError> {
        let inner = self.inner.borrow();
        let mut keys: Vec<u32> = inner.store.keys().copied().filter(|&k| k > cursor).collect();
        keys.sort_unstable();
        let next = keys.last().copied().unwrap_or(0);
        Ok((next, keys))
    }

    fn bootstrap_allocator(&self, floor: u32) -> Result<(), FsError> {
        let mut inner = self.inner.borrow_mut();
        if inner.next_id < floor {
            inner.next_id = floor;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_with_no_key_assigns_increasing_ids() {
        let backend = MemoryBackend::new();
        let a = backend.put(None, b"a").unwrap();
        let b = backend.put(None, b"b").unwrap();
        assert!(b > a);
    }

    #[test]
    fn put_with_key_replaces_in_place() {
        let backend = MemoryBackend::new();
        let id = backend.put(Some(5), b"first").unwrap();
        assert_eq!(id, 5);
        backend.put(Some(5), b"second").unwrap();
        assert_eq!(backend.get(5).unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn get_missing_key_is_none_not_error() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get(999).unwrap(), None);
    }

    #[test]
    fn del_then_get_is_none() {
        let backend = MemoryBackend::new();
        let id = backend.put(None, b"x").unwrap();
        backend.del(id).unwrap();
        assert_eq!(backend.get(id).unwrap(), None);
    }

    #[test]
    fn scan_returns_keys_above_cursor() {
        let backend = MemoryBackend::new();
        backend.put(Some(1), b"a").unwrap();
        backend.put(Some(2), b"b").unwrap();
        backend.put(Some(3), b"c").unwrap();
        let (_, keys) = backend.scan(1).unwrap();
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn bootstrap_allocator_raises_next_assigned_id_past_floor() {
        let backend = MemoryBackend::new();
        backend.bootstrap_allocator(1).unwrap();
        let id = backend.put(None, b"a").unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn bootstrap_allocator_never_lowers_an_existing_counter() {
        let backend = MemoryBackend::new();
        backend.put(None, b"a").unwrap();
        backend.put(None, b"b").unwrap();
        backend.bootstrap_allocator(1).unwrap();
        let id = backend.put(None, b"c").unwrap();
        assert_eq!(id, 3);
    }
}

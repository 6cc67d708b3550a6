use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use rusqlite::Connection;

/// A fixed-size pool of SQLite connections. Every store call leases exactly
/// one connection for the duration of a statement; leases are returned on
/// drop and waiters are woken through the condvar.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    init: Box<dyn Fn(&Connection) -> rusqlite::Result<()> + Send + Sync>,
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
}

impl Pool {
    /// Opens `size` connections against the database at `path`, running
    /// `init` (pragmas, custom SQL functions) on each.
    pub fn open<F>(path: &Path, size: usize, init: F) -> rusqlite::Result<Self>
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        assert!(size > 0, "a pool needs at least one connection");

        let inner = Inner {
            path: path.to_owned(),
            init: Box::new(init),
            idle: Mutex::new(Vec::with_capacity(size)),
            available: Condvar::new(),
        };

        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            connections.push(inner.connect()?);
        }
        *inner.idle.lock().unwrap() = connections;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Blocks until a connection is free.
    pub fn lease(&self) -> Lease<'_> {
        let mut idle = self.inner.idle.lock().unwrap();
        loop {
            if let Some(conn) = idle.pop() {
                return Lease {
                    conn: Some(conn),
                    pool: &self.inner,
                };
            }
            idle = self.inner.available.wait(idle).unwrap();
        }
    }

    /// Replace a connection that went bad (the transient-error path). The
    /// broken one is dropped, a fresh one joins the pool.
    pub fn replace(&self, mut lease: Lease<'_>) -> rusqlite::Result<()> {
        drop(lease.conn.take());
        let fresh = self.inner.connect()?;
        self.inner.put_back(fresh);
        Ok(())
    }
}

impl Inner {
    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        (self.init)(&conn)?;
        Ok(conn)
    }

    fn put_back(&self, conn: Connection) {
        self.idle.lock().unwrap().push(conn);
        self.available.notify_one();
    }
}

pub struct Lease<'a> {
    conn: Option<Connection>,
    pool: &'a Inner,
}

impl std::ops::Deref for Lease<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("present until drop")
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leases_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("test.db"), 2, |_| Ok(())).unwrap();

        let a = pool.lease();
        let b = pool.lease();
        drop(a);
        let _c = pool.lease();
        drop(b);
    }

    #[test]
    fn init_runs_on_every_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("test.db"), 3, |conn| {
            conn.execute_batch("PRAGMA user_version = 7")
        })
        .unwrap();

        let lease = pool.lease();
        let version: i64 = lease
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(7, version);
    }

    #[test]
    fn shared_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("test.db"), 2, |_| Ok(())).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for _ in 0..20 {
                        let lease = pool.lease();
                        let one: i64 =
                            lease.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
                        assert_eq!(1, one);
                    }
                });
            }
        });
    }
}

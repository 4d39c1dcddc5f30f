use std::collections::VecDeque;
use std::ops::Deref;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::database::schema::CONNECTION_PRAGMAS;
use crate::error::Result;
use crate::utils::config::{DatabaseConfig, SqliteTarget};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

fn log_statement(sql: &str) {
    debug!(target: "fpstore::sql", "{}", sql);
}

#[derive(Debug)]
struct ConnectionCustomizer {
    echo: bool,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        if self.echo {
            conn.trace(Some(log_statement));
        }
        Ok(())
    }
}

/// Whether a session takes the write lock up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Read,
    Write,
}

/// Owns the connection pool and hands out [`Session`]s bound to pooled connections.
pub struct SessionFactory {
    pool: Pool<SqliteConnectionManager>,
}

impl SessionFactory {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let (manager, max_size) = match config.sqlite_target()? {
            SqliteTarget::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                // WAL lets streaming readers coexist with a writer.
                let conn = Connection::open(&path)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                (SqliteConnectionManager::file(path), config.pool_size())
            }
            // Pooled memory connections share one database through SQLite's shared cache,
            // which locks per table and ignores the busy timeout. A single connection
            // serializes access instead.
            SqliteTarget::Memory => (SqliteConnectionManager::memory(), 1),
        };

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(CONNECTION_TIMEOUT)
            .connection_customizer(Box::new(ConnectionCustomizer { echo: config.echo }))
            .build(manager)?;

        debug!("Connection pool ready (max_size: {})", max_size);
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn idle_connections(&self) -> u32 {
        self.pool.state().idle_connections
    }

    pub fn begin(&self, mode: SessionMode) -> Result<Session> {
        Session::begin(self.pool.get()?, mode)
    }

    /// Runs `work` inside one transaction: commits when it returns `Ok`, rolls back
    /// when it returns `Err` (the error is passed through unchanged). The connection
    /// goes back to the pool on every path, including unwinding.
    pub fn scoped<T>(&self, mode: SessionMode, work: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let session = self.begin(mode)?;
        match work(&session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                session.rollback();
                Err(err)
            }
        }
    }
}

/// A unit of work on one pooled connection.
///
/// Dropping a session that was neither committed nor rolled back rolls it back.
pub struct Session {
    conn: PooledConnection<SqliteConnectionManager>,
    open: bool,
}

impl Session {
    fn begin(conn: PooledConnection<SqliteConnectionManager>, mode: SessionMode) -> Result<Self> {
        conn.execute_batch(match mode {
            SessionMode::Read => "BEGIN DEFERRED",
            SessionMode::Write => "BEGIN IMMEDIATE",
        })?;
        Ok(Self { conn, open: true })
    }

    pub fn commit(mut self) -> Result<()> {
        // On failure `open` stays set and Drop rolls back.
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Rollback failed: {}", e);
        }
    }
}

impl Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rollback_in_place();
    }
}

type Fetch<T> = Box<dyn FnMut(&Connection) -> Result<Option<Vec<T>>> + Send>;

/// One-shot lazy sequence backed by a read session.
///
/// Rows are pulled a batch at a time through `fetch`, which returns `None` once
/// there is nothing left. The session, and with it the pooled connection, is held
/// until the sequence is exhausted, fails, or is dropped. After the first error
/// the sequence ends.
pub struct SessionStream<T> {
    session: Option<Session>,
    buffer: VecDeque<T>,
    fetch: Fetch<T>,
}

impl<T> SessionStream<T> {
    pub(crate) fn new(
        session: Session,
        fetch: impl FnMut(&Connection) -> Result<Option<Vec<T>>> + Send + 'static,
    ) -> Self {
        Self {
            session: Some(session),
            buffer: VecDeque::new(),
            fetch: Box::new(fetch),
        }
    }

    /// A sequence that yields nothing and never touches the database.
    pub(crate) fn empty() -> Self {
        Self {
            session: None,
            buffer: VecDeque::new(),
            fetch: Box::new(|_| Ok(None)),
        }
    }

    /// True while the stream still holds its connection.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

impl<T> Iterator for SessionStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }

            let session = self.session.as_ref()?;
            match (self.fetch)(&**session) {
                Ok(Some(batch)) => self.buffer.extend(batch),
                Ok(None) => {
                    let session = self.session.take()?;
                    return session.commit().err().map(Err);
                }
                Err(e) => {
                    self.session = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn factory(dir: &tempfile::TempDir) -> SessionFactory {
        // One connection, so anything that fails to give it back is visible.
        let config = DatabaseConfig {
            pool_size: Some(1),
            ..DatabaseConfig::sqlite_file(dir.path().join("session.db"))
        };
        let factory = SessionFactory::open(&config).unwrap();
        factory
            .scoped(SessionMode::Write, |s| {
                s.execute_batch("CREATE TABLE t (v INTEGER PRIMARY KEY)")?;
                Ok(())
            })
            .unwrap();
        factory
    }

    fn count(factory: &SessionFactory) -> i64 {
        factory
            .scoped(SessionMode::Read, |s| {
                Ok(s.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap()
    }

    #[test]
    fn test_scoped_commits_on_ok() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);

        factory
            .scoped(SessionMode::Write, |s| {
                s.execute("INSERT INTO t VALUES (1)", [])?;
                s.execute("INSERT INTO t VALUES (2)", [])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(count(&factory), 2);
    }

    #[test]
    fn test_scoped_rolls_back_and_passes_error_through() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);

        let err = factory
            .scoped(SessionMode::Write, |s| {
                s.execute("INSERT INTO t VALUES (1)", [])?;
                s.execute("INSERT INTO t VALUES (1)", [])?;
                Ok(())
            })
            .unwrap_err();

        assert!(err.is_constraint(), "got {err:?}");
        assert_eq!(count(&factory), 0);

        let err = factory
            .scoped(SessionMode::Write, |s| -> Result<()> {
                s.execute("INSERT INTO t VALUES (5)", [])?;
                Err(StoreError::InvalidConfig("caller failure".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(m) if m == "caller failure"));
        assert_eq!(count(&factory), 0);
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);

        {
            let session = factory.begin(SessionMode::Write).unwrap();
            session.execute("INSERT INTO t VALUES (7)", []).unwrap();
        }

        assert_eq!(count(&factory), 0);
    }

    #[test]
    fn test_stream_releases_connection_when_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        factory
            .scoped(SessionMode::Write, |s| {
                s.execute_batch("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); INSERT INTO t VALUES (3);")?;
                Ok(())
            })
            .unwrap();

        let mut last = 0i64;
        let mut stream = SessionStream::new(factory.begin(SessionMode::Read).unwrap(), move |conn| {
            let batch: Vec<i64> = conn
                .prepare("SELECT v FROM t WHERE v > ?1 ORDER BY v LIMIT 2")?
                .query_map([last], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            match batch.last() {
                Some(v) => {
                    last = *v;
                    Ok(Some(batch))
                }
                None => Ok(None),
            }
        });

        assert!(stream.is_active());
        assert_eq!(factory.idle_connections(), 0);

        let values: Vec<i64> = stream.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(!stream.is_active());
        assert!(stream.next().is_none());

        // Released while the stream itself is still alive.
        assert_eq!(factory.idle_connections(), 1);
        assert_eq!(count(&factory), 3);
    }

    #[test]
    fn test_dropped_stream_releases_connection() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);

        let stream = SessionStream::new(factory.begin(SessionMode::Read).unwrap(), |_| Ok(Some(vec![1i64])));
        assert_eq!(factory.idle_connections(), 0);
        drop(stream);

        assert_eq!(factory.idle_connections(), 1);
        assert_eq!(count(&factory), 0);
    }

    #[test]
    fn test_empty_stream_has_no_session() {
        let mut stream = SessionStream::<i64>::empty();
        assert!(!stream.is_active());
        assert!(stream.next().is_none());
    }
}

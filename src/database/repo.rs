use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::database::schema::{DROP_SCHEMA, SCHEMA};
use crate::database::session::{SessionFactory, SessionMode, SessionStream};
use crate::error::Result;
use crate::models::{FileSha1, FingerprintHash, Song};
use crate::utils::config::DatabaseConfig;

/// Rows fetched per round trip by the streaming reads.
const PAGE_SIZE: i64 = 500;

pub type SongStream = SessionStream<Song>;

/// `(song_id, song_offset)` of one stored fingerprint.
pub type FingerprintStream = SessionStream<(i64, i64)>;

/// Songs and their fingerprints in SQLite.
///
/// Each public operation runs in exactly one transaction. Streaming reads keep
/// their transaction, and its pooled connection, until the stream is finished
/// or dropped. A store can be shared across threads.
pub struct FingerprintStore {
    pub(crate) sessions: SessionFactory,
}

impl FingerprintStore {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self {
            sessions: SessionFactory::open(config)?,
        })
    }

    /// Creates missing tables, then deletes songs left unfinished by an earlier run.
    pub fn setup(&self) -> Result<()> {
        let pruned = self.sessions.scoped(SessionMode::Write, |conn| {
            conn.execute_batch(SCHEMA)?;
            // Cascades to any fingerprints a crashed ingest left behind
            delete_unfingerprinted(conn)
        })?;
        info!("Schema ready, pruned {} unfinished songs", pruned);
        Ok(())
    }

    /// Drops and recreates both tables. All data is lost.
    pub fn reset_all(&self) -> Result<()> {
        self.sessions.scoped(SessionMode::Write, |conn| {
            conn.execute_batch(DROP_SCHEMA)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        info!("All songs and fingerprints dropped");
        Ok(())
    }

    /// Deletes every song not marked fingerprinted, along with its fingerprints.
    pub fn prune_unfingerprinted_songs(&self) -> Result<usize> {
        let pruned = self.sessions.scoped(SessionMode::Write, |conn| delete_unfingerprinted(conn))?;
        info!("Pruned {} unfinished songs", pruned);
        Ok(pruned)
    }

    /// Number of fingerprinted songs. Registrations still in progress are not counted.
    pub fn count_songs(&self) -> Result<u64> {
        self.sessions.scoped(SessionMode::Read, |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM songs WHERE fingerprinted = 1", [], |row| row.get(0))?)
        })
    }

    pub fn count_fingerprints(&self) -> Result<u64> {
        self.sessions.scoped(SessionMode::Read, |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?)
        })
    }

    /// Looks a song up by id whether or not it has been fingerprinted yet.
    pub fn get_song(&self, song_id: i64) -> Result<Option<Song>> {
        self.sessions.scoped(SessionMode::Read, |conn| {
            Ok(conn
                .query_row(
                    "SELECT song_id, name, fingerprinted, file_sha1 FROM songs WHERE song_id = ?1",
                    params![song_id],
                    Song::from_row,
                )
                .optional()?)
        })
    }

    /// Streams fingerprinted songs in id order.
    pub fn list_songs(&self) -> Result<SongStream> {
        let session = self.sessions.begin(SessionMode::Read)?;
        let mut after = 0i64;
        Ok(SessionStream::new(session, move |conn| {
            let page: Vec<Song> = conn
                .prepare_cached(
                    "SELECT song_id, name, fingerprinted, file_sha1 FROM songs
                     WHERE fingerprinted = 1 AND song_id > ?1
                     ORDER BY song_id LIMIT ?2",
                )?
                .query_map(params![after, PAGE_SIZE], Song::from_row)?
                .collect::<rusqlite::Result<_>>()?;

            match page.last() {
                Some(song) => {
                    after = song.song_id;
                    Ok(Some(page))
                }
                None => Ok(None),
            }
        }))
    }

    /// Returns the id of the song called `name`, registering it when there is none.
    ///
    /// The lookup matches on name alone: registering a name that already exists
    /// returns the existing id even if `file_sha1` differs. Two callers racing on the
    /// same new name serialize on SQLite's write lock and the later one sees the
    /// earlier one's row.
    pub fn register_song(&self, name: &str, file_sha1: &FileSha1) -> Result<i64> {
        self.sessions.scoped(SessionMode::Write, |conn| {
            // Reuse an existing registration
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT song_id FROM songs WHERE name = ?1 ORDER BY song_id LIMIT 1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(song_id) = existing {
                debug!("Song {:?} already registered as {}", name, song_id);
                return Ok(song_id);
            }

            // New song, unfinished until mark_song_fingerprinted.
            // The id is allocated here, before commit.
            conn.execute(
                "INSERT INTO songs (name, fingerprinted, file_sha1) VALUES (?1, 0, ?2)",
                params![name, file_sha1],
            )?;
            let song_id = conn.last_insert_rowid();
            debug!("Registered song {:?} as {}", name, song_id);
            Ok(song_id)
        })
    }

    /// Fails with a constraint error if the triple already exists or `song_id` is unknown.
    pub fn insert_fingerprint(&self, hash: &FingerprintHash, song_id: i64, offset: u32) -> Result<()> {
        self.sessions.scoped(SessionMode::Write, |conn| {
            conn.execute(
                "INSERT INTO fingerprints (hash, song_id, song_offset) VALUES (?1, ?2, ?3)",
                params![hash, song_id, offset],
            )?;
            Ok(())
        })
    }

    /// Inserts all `(hash, offset)` pairs for one song, or none of them.
    pub fn insert_fingerprints_bulk<I>(&self, song_id: i64, pairs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (FingerprintHash, u32)>,
    {
        let inserted = self.sessions.scoped(SessionMode::Write, |conn| {
            // One prepared statement for the whole batch; any failure rolls back all of it.
            let mut stmt = conn.prepare_cached(
                "INSERT INTO fingerprints (hash, song_id, song_offset) VALUES (?1, ?2, ?3)",
            )?;
            let mut inserted = 0usize;
            for (hash, offset) in pairs {
                stmt.execute(params![hash, song_id, offset])?;
                inserted += 1;
            }
            Ok(inserted)
        })?;
        debug!("Inserted {} fingerprints for song {}", inserted, song_id);
        Ok(inserted)
    }

    /// Marks a song as completely fingerprinted.
    ///
    /// A missing id, or one that matches no song, is logged and skipped rather than
    /// raised, so this is safe to call from cleanup paths.
    pub fn mark_song_fingerprinted(&self, song_id: Option<i64>) -> Result<()> {
        let Some(song_id) = song_id else {
            warn!("mark_song_fingerprinted: no song id given");
            return Ok(());
        };

        let updated = self.sessions.scoped(SessionMode::Write, |conn| {
            Ok(conn.execute(
                "UPDATE songs SET fingerprinted = 1 WHERE song_id = ?1",
                params![song_id],
            )?)
        })?;
        if updated == 0 {
            warn!("mark_song_fingerprinted: no song with id {}", song_id);
        }
        Ok(())
    }

    /// All `(song_id, song_offset)` pairs stored under one hash.
    pub fn query_hash(&self, hash: &FingerprintHash) -> Result<Vec<(i64, i64)>> {
        self.sessions.scoped(SessionMode::Read, |conn| {
            let rows = conn
                .prepare_cached(
                    "SELECT song_id, song_offset FROM fingerprints WHERE hash = ?1 ORDER BY song_id, song_offset",
                )?
                .query_map(params![hash], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            Ok(rows)
        })
    }

    /// Streams `(song_id, song_offset)` for every stored fingerprint.
    pub fn all_fingerprints(&self) -> Result<FingerprintStream> {
        let session = self.sessions.begin(SessionMode::Read)?;
        let mut after = 0i64;
        Ok(SessionStream::new(session, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT rowid, song_id, song_offset FROM fingerprints
                 WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![after, PAGE_SIZE])?;
            let mut page = Vec::new();
            while let Some(row) = rows.next()? {
                // Keyset cursor
                after = row.get(0)?;
                page.push((row.get(1)?, row.get(2)?));
            }
            Ok(if page.is_empty() { None } else { Some(page) })
        }))
    }
}

fn delete_unfingerprinted(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM songs WHERE fingerprinted = 0", [])?)
}

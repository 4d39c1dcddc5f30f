pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS songs (
        song_id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        fingerprinted BOOLEAN NOT NULL DEFAULT 0,
        file_sha1 BLOB NOT NULL CHECK (length(file_sha1) = 20),
        UNIQUE(name, file_sha1)
    );

    CREATE TABLE IF NOT EXISTS fingerprints (
        hash BLOB NOT NULL CHECK (length(hash) = 8),
        song_id INTEGER NOT NULL,
        song_offset INTEGER NOT NULL CHECK (song_offset >= 0),
        FOREIGN KEY(song_id) REFERENCES songs(song_id) ON DELETE CASCADE,
        PRIMARY KEY(hash, song_id, song_offset)
    );

    CREATE INDEX IF NOT EXISTS ix_fingerprints_hash ON fingerprints (hash);
    CREATE INDEX IF NOT EXISTS ix_fingerprints_song_id ON fingerprints (song_id);
";

/// Fingerprints go first: they reference songs.
pub const DROP_SCHEMA: &str = "
    DROP TABLE IF EXISTS fingerprints;
    DROP TABLE IF EXISTS songs;
";

/// Per-connection settings. Cascading deletes need foreign keys switched on.
pub const CONNECTION_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA synchronous = NORMAL;
";

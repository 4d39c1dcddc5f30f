//! Storage and batch matching for audio fingerprints.
//!
//! Songs are registered, fingerprinted in bulk and then marked complete; a probe
//! set of `(hash, offset)` pairs is matched into `(song_id, offset_difference)`
//! correspondences for a downstream vote.

pub mod database;
pub mod error;
pub mod ingest;
pub mod models;
pub mod utils;

pub use database::matcher::{MatchStream, ProbeSet, MAX_LOOKUP_BATCH};
pub use database::repo::{FingerprintStore, FingerprintStream, SongStream};
pub use database::session::{Session, SessionFactory, SessionMode, SessionStream};
pub use error::{Result, StoreError};
pub use models::{Correspondence, FileSha1, FingerprintHash, Song};
pub use utils::config::DatabaseConfig;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::database::repo::FingerprintStore;
use crate::database::session::{SessionMode, SessionStream};
use crate::error::Result;
use crate::models::{Correspondence, FingerprintHash};

/// Upper bound on bound parameters in one `IN (...)` lookup. SQLite builds before
/// 3.32 reject statements with more than 999 host parameters.
pub const MAX_LOOKUP_BATCH: usize = 999;

pub type MatchStream = SessionStream<Correspondence>;

/// Probe hashes in first-seen order, each with the offset of its last occurrence.
#[derive(Debug, Default, Clone)]
pub struct ProbeSet {
    order: Vec<FingerprintHash>,
    offsets: HashMap<FingerprintHash, i64>,
}

impl ProbeSet {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn offset(&self, hash: &FingerprintHash) -> Option<i64> {
        self.offsets.get(hash).copied()
    }

    pub fn hashes(&self) -> &[FingerprintHash] {
        &self.order
    }

    /// Splits the distinct hashes into lookup batches of at most `size`.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[FingerprintHash]> {
        self.order.chunks(size.max(1))
    }
}

impl<O: Into<i64>> FromIterator<(FingerprintHash, O)> for ProbeSet {
    fn from_iter<I: IntoIterator<Item = (FingerprintHash, O)>>(iter: I) -> Self {
        let mut probe = ProbeSet::default();
        for (hash, offset) in iter {
            match probe.offsets.entry(hash) {
                // Repeated hash: later offset wins, position stays.
                Entry::Occupied(mut e) => {
                    e.insert(offset.into());
                }
                Entry::Vacant(e) => {
                    e.insert(offset.into());
                    probe.order.push(hash);
                }
            }
        }
        probe
    }
}

impl FingerprintStore {
    /// Finds every stored fingerprint sharing a hash with `probe` and yields
    /// `(song_id, stored_offset - probe_offset)` for each.
    ///
    /// When a hash occurs more than once in the probe, its last offset is used.
    /// Hashes are looked up in batches of [`MAX_LOOKUP_BATCH`], one query per batch
    /// as the stream is consumed, in first-seen order. All correspondences of a batch
    /// are yielded before the next batch is queried. An empty probe yields nothing
    /// and never touches the database.
    pub fn match_hashes<I, O>(&self, probe: I) -> Result<MatchStream>
    where
        I: IntoIterator<Item = (FingerprintHash, O)>,
        O: Into<i64>,
    {
        self.match_probe(probe.into_iter().collect(), MAX_LOOKUP_BATCH)
    }

    pub(crate) fn match_probe(&self, probe: ProbeSet, batch_size: usize) -> Result<MatchStream> {
        if probe.is_empty() {
            return Ok(SessionStream::empty());
        }

        // Short last batch, no padding.
        let mut batches: VecDeque<Vec<FingerprintHash>> =
            probe.chunks(batch_size).map(<[_]>::to_vec).collect();
        debug!("Matching {} distinct hashes in {} lookups", probe.len(), batches.len());

        // One lookup per pull; the stream ends when the batches run out.
        let session = self.sessions.begin(SessionMode::Read)?;
        Ok(SessionStream::new(session, move |conn| match batches.pop_front() {
            Some(batch) => lookup_batch(conn, &batch, &probe).map(Some),
            None => Ok(None),
        }))
    }
}

fn lookup_batch(conn: &Connection, batch: &[FingerprintHash], probe: &ProbeSet) -> Result<Vec<Correspondence>> {
    let placeholders = vec!["?"; batch.len()].join(",");
    let sql = format!("SELECT song_id, song_offset, hash FROM fingerprints WHERE hash IN ({placeholders})");

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params_from_iter(batch.iter()))?;
    let mut found = Vec::new();
    while let Some(row) = rows.next()? {
        let song_id: i64 = row.get(0)?;
        let song_offset: i64 = row.get(1)?;
        let hash: FingerprintHash = row.get(2)?;
        // Every row came from this batch, so the lookup always hits
        if let Some(probe_offset) = probe.offset(&hash) {
            found.push(Correspondence {
                song_id,
                offset_difference: song_offset - probe_offset,
            });
        }
    }

    debug!("Lookup of {} hashes matched {} fingerprints", batch.len(), found.len());
    Ok(found)
}

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::models::FingerprintHash;

/// Reads `(hash, offset)` pairs, one `hex_hash<TAB>offset` per line.
///
/// Blank lines and lines starting with `#` are skipped. Offsets written as
/// decimals are truncated; negative offsets are rejected.
pub fn read_pairs(path: &Path) -> Result<Vec<(FingerprintHash, u32)>> {
    let file = File::open(path).with_context(|| format!("Failed to open hash file: {:?}", path))?;
    parse_pairs(BufReader::new(file)).with_context(|| format!("Failed to parse {:?}", path))
}

pub fn parse_pairs(reader: impl BufRead) -> Result<Vec<(FingerprintHash, u32)>> {
    let mut pairs = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (hash, offset) = line
            .split_once(|c: char| c == '\t' || c == ' ')
            .ok_or_else(|| anyhow!("line {}: expected `hash<TAB>offset`", lineno + 1))?;

        let hash: FingerprintHash = hash.parse().with_context(|| format!("line {}", lineno + 1))?;
        let offset = parse_offset(offset.trim()).ok_or_else(|| anyhow!("line {}: bad offset {:?}", lineno + 1, offset))?;
        pairs.push((hash, offset));
    }

    Ok(pairs)
}

fn parse_offset(s: &str) -> Option<u32> {
    if let Ok(n) = s.parse::<u32>() {
        return Some(n);
    }
    let f = s.parse::<f64>().ok()?;
    (f.is_finite() && f >= 0.0 && f <= u32::MAX as f64).then(|| f.trunc() as u32)
}

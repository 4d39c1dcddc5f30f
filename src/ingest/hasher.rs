use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use sha1::{Digest, Sha1};

use crate::models::FileSha1;

const MMAP_THRESHOLD: u64 = 64 * 1024 * 1024; // 64 MB

/// SHA-1 of a song's source audio file, the content identity stored with the song.
pub fn file_sha1(path: &Path) -> Result<FileSha1> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let len = file.metadata()?.len();

    let mut hasher = Sha1::new();

    if len > MMAP_THRESHOLD {
        // The file must not be truncated while mapped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        hasher.update(&mmap[..]);
    } else {
        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];
        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
    }

    Ok(FileSha1::from_bytes(hasher.finalize().into()))
}

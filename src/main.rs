use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use fpstore::ingest::{hasher, hashes};
use fpstore::{DatabaseConfig, FingerprintStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON database config. Without it, FPSTORE_* environment variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every SQL statement.
    #[arg(long)]
    echo: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create missing tables and prune unfinished songs.
    Setup,
    /// Drop and recreate all tables.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Print song and fingerprint counts.
    Stats,
    /// Print fingerprinted songs as JSON lines.
    Songs,
    /// Delete songs that were never marked fingerprinted.
    Prune,
    /// Register a song and store its fingerprints. Run `setup` once beforehand.
    Ingest {
        #[arg(short, long)]
        name: String,
        /// Source audio file, hashed to identify the song's content.
        #[arg(short, long)]
        audio: PathBuf,
        /// `hash<TAB>offset` lines produced by the fingerprinter.
        #[arg(long)]
        hashes: PathBuf,
    },
    /// Print `song_id<TAB>offset_difference` for every stored match of a probe.
    Match {
        #[arg(long)]
        hashes: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DatabaseConfig::from_json_file(path).context("Failed to load config")?,
        None => DatabaseConfig::from_env(),
    };
    config.echo |= args.echo;

    // Echoed statements are logged at debug level.
    let level = if config.echo { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let store = FingerprintStore::open(&config).context("Failed to open fingerprint store")?;

    match args.command {
        Command::Setup => store.setup()?,
        Command::Reset { yes } => {
            if !yes {
                warn!("Refusing to drop all data without --yes");
                return Ok(());
            }
            store.reset_all()?;
        }
        Command::Stats => {
            println!("songs\t{}", store.count_songs()?);
            println!("fingerprints\t{}", store.count_fingerprints()?);
        }
        Command::Songs => {
            let mut out = BufWriter::new(io::stdout().lock());
            for song in store.list_songs()? {
                serde_json::to_writer(&mut out, &song?)?;
                writeln!(out)?;
            }
            out.flush()?;
        }
        Command::Prune => {
            let pruned = store.prune_unfingerprinted_songs()?;
            println!("pruned\t{}", pruned);
        }
        Command::Ingest { name, audio, hashes: hash_file } => {
            let sha1 = hasher::file_sha1(&audio)?;
            let pairs = hashes::read_pairs(&hash_file)?;

            let song_id = store.register_song(&name, &sha1)?;
            let inserted = store
                .insert_fingerprints_bulk(song_id, pairs)
                .with_context(|| format!("Failed to store fingerprints for {:?}", name))?;
            store.mark_song_fingerprinted(Some(song_id))?;

            info!("Ingested {:?} as song {} ({} fingerprints)", name, song_id, inserted);
            println!("{}", song_id);
        }
        Command::Match { hashes: hash_file } => {
            let probe = hashes::read_pairs(&hash_file)?;
            let mut out = BufWriter::new(io::stdout().lock());
            for found in store.match_hashes(probe)? {
                let found = found?;
                writeln!(out, "{}\t{}", found.song_id, found.offset_difference)?;
            }
            out.flush()?;
        }
    }

    Ok(())
}

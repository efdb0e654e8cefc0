use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use journal::writer_lock::lock_owner;
use journal::{JournalConfig, JournalReader, JournalSnapshot, SegmentedJournalReader};

#[derive(Parser)]
#[command(name = "journal-cli", version, about = "Segmented journal tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print segment layout and index bounds.
    Stat { journal_dir: PathBuf },
    /// Print records starting at an index.
    Dump {
        journal_dir: PathBuf,
        #[arg(long = "from")]
        from: Option<i64>,
        #[arg(long = "limit")]
        limit: Option<usize>,
        #[arg(long = "hexdump")]
        hexdump: bool,
    },
    /// Report where a reader lands for an ASQN.
    SeekAsqn { journal_dir: PathBuf, asqn: i64 },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Read-only snapshot: no writer lock is taken and nothing is repaired.
fn open(journal_dir: &Path) -> anyhow::Result<JournalSnapshot> {
    anyhow::ensure!(
        journal_dir.is_dir(),
        "no journal directory at {}",
        journal_dir.display()
    );
    let config = JournalConfig::new(journal_dir);
    if let Some(pid) = lock_owner(journal_dir)? {
        log::debug!("journal last opened by pid {pid}");
    }
    JournalSnapshot::open(&config)
        .with_context(|| format!("open journal {}", journal_dir.display()))
}

fn open_reader(journal_dir: &Path) -> anyhow::Result<SegmentedJournalReader> {
    let snapshot = open(journal_dir)?;
    anyhow::ensure!(
        !snapshot.segments().is_empty(),
        "no segments in {}",
        journal_dir.display()
    );
    Ok(snapshot.open_reader()?)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Stat { journal_dir } => {
            let journal = open(&journal_dir)?;
            writeln!(out, "first_index: {}", journal.first_index())?;
            writeln!(out, "last_index:  {}", journal.last_index())?;
            writeln!(out, "last_asqn:   {}", journal.last_asqn())?;
            for segment in journal.segments() {
                writeln!(
                    out,
                    "segment {:>9}  [{}, {}]  {} bytes{}",
                    segment.id(),
                    segment.first_index(),
                    segment.last_index(),
                    segment.max_size(),
                    if segment.is_sealed() { "  sealed" } else { "" }
                )?;
            }
        }
        Commands::Dump {
            journal_dir,
            from,
            limit,
            hexdump,
        } => {
            let mut reader = open_reader(&journal_dir)?;
            if let Some(from) = from {
                reader.seek(from)?;
            }
            let mut printed = 0usize;
            while limit.map_or(true, |limit| printed < limit) {
                let Some(record) = reader.next()? else {
                    break;
                };
                writeln!(
                    out,
                    "index={} asqn={} len={} crc={:08x}",
                    record.index,
                    record.asqn,
                    record.payload.len(),
                    record.checksum
                )?;
                if hexdump {
                    write_hex(&mut out, &record.payload)?;
                }
                printed += 1;
            }
        }
        Commands::SeekAsqn { journal_dir, asqn } => {
            let mut reader = open_reader(&journal_dir)?;
            let next = reader.seek_to_asqn(asqn)?;
            match reader.next()? {
                Some(record) => writeln!(
                    out,
                    "asqn {asqn} -> index {next} (record asqn {})",
                    record.asqn
                )?,
                None => writeln!(out, "asqn {asqn} -> index {next} (end of journal)")?,
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn write_hex(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        write!(out, "  {:06x} ", row * 16)?;
        for byte in chunk {
            write!(out, " {byte:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

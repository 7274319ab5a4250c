mod cli;

use clap::Parser;
use cli::{Cli, Command};
use snafu::{ResultExt, Snafu};
use std::fs::File;
use std::path::{Path, PathBuf};
use wimfile::progress::{SilentProgress, WimProgress};
use wimfile::{IntegrityStatus, ReadAt, Wim};

/// Top-level application errors for wimfile-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open WIM file '{}'", path.display()))]
    OpenFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to memory map '{}'", path.display()))]
    MmapFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse WIM file '{}'", path.display()))]
    ParseWim {
        path: PathBuf,
        source: wimfile::OpenError,
    },

    #[snafu(display("failed to check integrity"))]
    CheckIntegrity {
        source: wimfile::integrity::IntegrityError,
    },

    #[snafu(display("integrity check found a corrupt slice (first bad chunk #{chunk})"))]
    IntegrityNotOk { chunk: usize },

    #[snafu(display("WIM carries no integrity table"))]
    NoIntegrityTable,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Info { wim_path } => cmd_info(&wim_path),
        Command::List { wim_path, metadata } => cmd_list(&wim_path, metadata),
        Command::Verify { wim_path, quiet } => cmd_verify(&wim_path, quiet),
    }
}

/// A memory-mapped WIM file usable as a positional-read source.
struct MappedWim(memmap2::Mmap);

impl ReadAt for MappedWim {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0[..].read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Opens a WIM through a memory map.
///
/// The map stays valid for the lifetime of the returned [`Wim`]; the usual
/// memory-map caveat applies (the file must not be truncated concurrently).
fn open_wim(path: &Path) -> Result<Wim> {
    let file = File::open(path).context(OpenFileSnafu { path })?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }.context(MmapFileSnafu { path })?;

    Wim::from_reader(MappedWim(mmap)).context(ParseWimSnafu { path })
}

fn format_guid(guid: &[u8; 16]) -> String {
    guid.iter().map(|b| format!("{:02x}", b)).collect()
}

fn cmd_info(path: &Path) -> Result<()> {
    let wim = open_wim(path)?;
    let header = wim.header();

    println!("WIM file:        {}", path.display());
    println!("GUID:            {}", format_guid(wim.guid()));
    println!("Version:         {:#x}", header.version);
    println!("Flags:           {}", header.flags);
    println!(
        "Compression:     {}",
        match wim.codec() {
            Some(codec) => codec.to_string(),
            None => "none".to_string(),
        }
    );
    println!("Chunk size:      {}", wim.chunk_size());
    println!(
        "Part:            {}/{}",
        header.part_number, header.total_parts
    );
    println!("Images:          {}", wim.image_count());
    println!("Boot index:      {}", wim.boot_index());
    println!("Streams:         {}", wim.store().len());
    println!("Pipable:         {}", wim.is_pipable());
    println!("Integrity table: {}", wim.has_integrity_table());

    Ok(())
}

fn cmd_list(path: &Path, metadata: bool) -> Result<()> {
    let wim = open_wim(path)?;

    println!("{:<40}  {:>12}  {:>12}  {:>4}  flags", "sha1", "size", "on disk", "refs");

    for lte in wim.store().sorted_for_write() {
        if lte.is_metadata() && !metadata {
            continue;
        }

        println!(
            "{:<40}  {:>12}  {:>12}  {:>4}  {}",
            lte.hash,
            lte.reshdr.uncompressed_size,
            lte.reshdr.size_in_wim,
            lte.refcount,
            lte.reshdr.flags,
        );
    }

    Ok(())
}

/// Progress reporter drawing an indicatif bar over integrity slices.
struct VerifyProgress {
    bar: indicatif::ProgressBar,
}

impl VerifyProgress {
    fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

impl WimProgress for VerifyProgress {
    fn integrity_chunk(&self, index: usize, total: usize) -> wimfile::ProgressAction {
        if self.bar.is_hidden() && total > 0 {
            self.bar
                .set_style(indicatif::ProgressStyle::default_bar());
            self.bar.set_length(total as u64);
            self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        }
        self.bar.set_position(index as u64 + 1);
        wimfile::ProgressAction::Continue
    }
}

fn cmd_verify(path: &Path, quiet: bool) -> Result<()> {
    let wim = open_wim(path)?;

    let status = if quiet {
        wim.check_integrity(&SilentProgress)
    } else {
        let progress = VerifyProgress::new();
        let status = wim.check_integrity(&progress);
        progress.bar.finish_and_clear();
        status
    }
    .context(CheckIntegritySnafu)?;

    match status {
        IntegrityStatus::Ok => {
            println!("{}: integrity OK", path.display());
            Ok(())
        }
        IntegrityStatus::NotOk { first_bad_chunk } => {
            IntegrityNotOkSnafu {
                chunk: first_bad_chunk,
            }
            .fail()
        }
        IntegrityStatus::Nonexistent => NoIntegrityTableSnafu.fail(),
    }
}

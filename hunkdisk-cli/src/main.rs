//! Hunk disk CLI - create, inspect and edit hard disk images.
//!
//! Usage:
//!   hunkdisk [--diff-dir DIR] [--config FILE] [--trace] <command>
//!
//! Examples:
//!   hunkdisk create hd0.hkd                       # Default 203/2/12 Alto-size disk
//!   hunkdisk create hd0.hkd --geometry big.json   # Geometry from JSON
//!   hunkdisk info hd0.hkd                         # Geometry and diff state
//!   hunkdisk read hd0.hkd 0                       # Hex dump of sector 0
//!   hunkdisk write hd0.hkd 0 --input boot.bin     # Replace sector 0
//!   hunkdisk info games.zip --region harddriv     # Disk inside a package

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hunkdisk_core::{
    DiskConfig, DiskError, DiskResult, FileStorage, Geometry, HardDiskDrive, Locator,
};

/// Hunk disk image tool
#[derive(Parser, Debug)]
#[command(name = "hunkdisk")]
#[command(about = "Create and edit hunk disk images")]
struct Args {
    /// Directory for diff images of read-only disks
    #[arg(long, global = true)]
    diff_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format a new image
    Create {
        image: PathBuf,
        /// JSON geometry record; missing fields take defaults
        #[arg(long)]
        geometry: Option<PathBuf>,
        #[arg(long)]
        cylinders: Option<u32>,
        #[arg(long)]
        heads: Option<u32>,
        #[arg(long)]
        sectors: Option<u32>,
        /// Sector size in 16-bit words
        #[arg(long)]
        sector_words: Option<u32>,
        #[arg(long)]
        hunk_bytes: Option<u32>,
    },
    /// Print geometry and overlay state as JSON
    Info {
        image: PathBuf,
        /// Disk region when IMAGE is a package
        #[arg(long)]
        region: Option<String>,
    },
    /// Dump one sector
    Read {
        image: PathBuf,
        sector: u32,
        #[arg(long)]
        region: Option<String>,
        /// Write raw bytes instead of a hex dump
        #[arg(long)]
        raw: bool,
    },
    /// Replace one sector
    Write {
        image: PathBuf,
        sector: u32,
        /// File holding the sector data; shorter input is zero-padded
        #[arg(long, conflicts_with = "fill")]
        input: Option<PathBuf>,
        /// Fill the sector with a single byte value
        #[arg(long)]
        fill: Option<u8>,
    },
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("hunkdisk=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hunkdisk=info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn locator(image: PathBuf, region: Option<String>) -> Locator {
    match region {
        Some(region) => Locator::Package {
            package: image,
            region,
        },
        None => Locator::Image(image),
    }
}

fn run(command: Command, config: DiskConfig) -> DiskResult<()> {
    let mut drive = HardDiskDrive::new(FileStorage::new(), config);

    match command {
        Command::Create {
            image,
            geometry,
            cylinders,
            heads,
            sectors,
            sector_words,
            hunk_bytes,
        } => {
            let mut g = match geometry {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Geometry::default(),
            };
            g.cylinders = cylinders.unwrap_or(g.cylinders);
            g.heads = heads.unwrap_or(g.heads);
            g.sectors = sectors.unwrap_or(g.sectors);
            g.sector_words = sector_words.unwrap_or(g.sector_words);
            g.hunk_bytes = hunk_bytes.unwrap_or(g.hunk_bytes);
            debug!(?g, "creating image");

            drive.format(&image, &g)?;
            println!(
                "Created {} ({} sectors)",
                image.display(),
                drive.total_sectors().unwrap_or(0)
            );
        }
        Command::Info { image, region } => {
            let locator = locator(image, region);
            drive.attach(&locator)?;
            let (Some(info), Some(handle)) = (drive.geometry(), drive.handle()) else {
                return Err(DiskError::NotAttached);
            };

            let metadata: Vec<_> = handle
                .target()
                .metadata()
                .iter()
                .map(|m| json!({ "tag": m.tag.to_string(), "index": m.index, "length": m.payload.len() }))
                .collect();
            let report = json!({
                "image": locator.path().display().to_string(),
                "overlay": handle.is_overlay(),
                "cylinders": info.cylinders,
                "heads": info.heads,
                "sectors": info.sectors,
                "sectorBytes": info.sector_bytes,
                "totalSectors": drive.total_sectors(),
                "logicalLength": handle.logical_length(),
                "hunkSize": handle.hunk_size(),
                "storedHunks": handle.target().stored_hunks(),
                "metadata": metadata,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Read {
            image,
            sector,
            region,
            raw,
        } => {
            drive.attach(&locator(image, region))?;
            let data = drive.read(sector)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if raw {
                out.write_all(&data)?;
            } else {
                for (row, chunk) in data.chunks(16).enumerate() {
                    let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                    writeln!(out, "{:06x}  {}", row * 16, hex.join(" "))?;
                }
            }
            out.flush()?;
        }
        Command::Write {
            image,
            sector,
            input,
            fill,
        } => {
            drive.attach(&Locator::Image(image))?;
            let len = drive
                .geometry()
                .map(|g| g.sector_bytes as usize)
                .ok_or(DiskError::NotAttached)?;

            let mut data = match input {
                Some(path) => std::fs::read(path)?,
                None => vec![fill.unwrap_or(0); len],
            };
            if data.len() > len {
                return Err(DiskError::SectorLength {
                    expected: len,
                    actual: data.len(),
                });
            }
            data.resize(len, 0);

            drive.write(sector, &data)?;
            let target = if drive.is_overlay() { "diff" } else { "image" };
            println!("Wrote sector {} ({} bytes) to {}", sector, len, target);
        }
    }

    drive.detach();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.trace);

    let mut config = match &args.config {
        Some(path) => DiskConfig::from_path(path)?,
        None => DiskConfig::default(),
    };
    if let Some(dir) = args.diff_dir {
        config.diff_directory = dir;
    }

    // Image I/O is synchronous; keep it off the async runtime.
    let command = args.command;
    tokio::task::spawn_blocking(move || run(command, config)).await??;

    Ok(())
}

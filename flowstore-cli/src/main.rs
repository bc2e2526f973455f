/*!
Flowstore CLI - operator tool for the flow configuration store.

Inspect, replace, archive and restore the persisted flow configuration
without running the application that owns it.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowstore_core::{BytesSerializer, FlowConfigurationStore, StorageConfig};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "flowstore")]
#[command(about = "CLI for the flowstore flow configuration store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path of the primary flow document
    #[arg(short, long, global = true, env = "FLOWSTORE_FLOW_PATH")]
    flow: Option<PathBuf>,

    /// JSON configuration file (overridden by --flow and --archive-dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Archive directory (defaults to `archive` beside the flow document,
    /// or FLOWSTORE_ARCHIVE_DIR when set)
    #[arg(short, long, global = true)]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the flow document (and its directories) if missing
    Init,
    /// Print the flow document to stdout
    Show {
        /// Emit the compressed bytes as stored
        #[arg(long)]
        raw: bool,
    },
    /// Atomically replace the flow document
    Save {
        /// Input file, or `-` for stdin
        input: PathBuf,
        /// Archive the new document after saving
        #[arg(long)]
        archive: bool,
        /// Input is already gzip framed
        #[arg(long)]
        raw_input: bool,
    },
    /// Archive the current flow document
    Archive,
    /// List archive entries
    Archives,
    /// Delete the oldest archive entries
    Prune {
        /// Number of entries to keep
        #[arg(short, long)]
        keep: usize,
    },
    /// Replace the flow document with an archive entry
    Restore {
        /// Archive entry path, or its file name inside the archive directory
        entry: PathBuf,
    },
}

#[derive(Tabled)]
struct ArchiveInfo {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Archived")]
    archived_at: String,
    #[tabled(rename = "Size")]
    size: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = create_storage_config(&cli)?;
    let store = FlowConfigurationStore::from_config(&config)
        .with_context(|| format!("Failed to open {}", config.flow_path.display()))?;

    match cli.command {
        Commands::Init => {
            println!("Flow configuration ready at {}", store.path().display());
        }
        Commands::Show { raw } => show_flow(&store, raw)?,
        Commands::Save {
            input,
            archive,
            raw_input,
        } => save_flow(&store, &input, archive, raw_input)?,
        Commands::Archive => {
            let archived = store.archive_now()?;
            println!("✓ Archived to {}", archived.display());
        }
        Commands::Archives => list_archives(&store)?,
        Commands::Prune { keep } => {
            let removed = store.prune_archives(keep)?;
            println!("✓ Removed {} archive entries", removed.len());
        }
        Commands::Restore { entry } => restore_flow(&store, &entry)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn create_storage_config(cli: &Cli) -> Result<StorageConfig, anyhow::Error> {
    let mut config = match (&cli.config, &cli.flow) {
        (Some(file), _) => StorageConfig::from_json_file(file)
            .with_context(|| format!("Failed to load configuration {}", file.display()))?,
        (None, Some(flow)) => StorageConfig::new(flow),
        (None, None) => anyhow::bail!("either --flow or --config is required"),
    };

    if let (Some(_), Some(flow)) = (&cli.config, &cli.flow) {
        config.flow_path = flow.clone();
    }
    config = config.apply_env_overrides();
    if let Some(dir) = &cli.archive_dir {
        config.archive_dir = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

fn show_flow(store: &FlowConfigurationStore, raw: bool) -> Result<(), anyhow::Error> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = store.load_with_mode(&mut out, raw)?;
    out.flush()?;

    if written == 0 {
        warn!("Flow configuration {} is empty", store.path().display());
    }
    Ok(())
}

fn save_flow(
    store: &FlowConfigurationStore,
    input: &Path,
    archive: bool,
    raw_input: bool,
) -> Result<(), anyhow::Error> {
    let mut document = Vec::new();
    if input == Path::new("-") {
        io::stdin().read_to_end(&mut document)?;
    } else {
        document = std::fs::read(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
    }

    if raw_input {
        use flowstore_core::{CompressionAdapter, GzipCompressor};
        document = GzipCompressor::new()
            .decompress(&document)
            .context("Input is not a valid gzip stream")?;
    }

    info!("Saving {} bytes to {}", document.len(), store.path().display());
    match store.save_document(&BytesSerializer(&document), archive)? {
        Some(archived) => println!("✓ Saved and archived to {}", archived.display()),
        None if archive => println!("✓ Saved (archiving failed, see log)"),
        None => println!("✓ Saved"),
    }
    Ok(())
}

fn list_archives(store: &FlowConfigurationStore) -> Result<(), anyhow::Error> {
    let entries = store.archives()?;
    if entries.is_empty() {
        println!("No archive entries in {}", store.archive_dir().display());
        return Ok(());
    }

    let rows: Vec<ArchiveInfo> = entries
        .iter()
        .map(|entry| ArchiveInfo {
            name: entry.file_name(),
            archived_at: format_timestamp(entry.archived_at()),
            size: format_size(entry.size),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn restore_flow(store: &FlowConfigurationStore, entry: &Path) -> Result<(), anyhow::Error> {
    let path = if entry.is_file() {
        entry.to_path_buf()
    } else {
        store.archive_dir().join(entry)
    };

    let written = store
        .restore_archive(&path)
        .with_context(|| format!("Failed to restore {}", path.display()))?;
    println!("✓ Restored {} ({})", path.display(), format_size(written));
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_timestamp_keeps_millis() {
        let ts = chrono::Utc.timestamp_nanos(1_700_000_000_123_000_000);
        assert!(format_timestamp(ts).ends_with(".123"));
    }

    #[test]
    fn test_config_requires_flow_or_config() {
        let cli = Cli::parse_from(["flowstore", "archives"]);
        if std::env::var_os("FLOWSTORE_FLOW_PATH").is_none() {
            assert!(create_storage_config(&cli).is_err());
        }
    }

    #[test]
    fn test_config_from_flags() {
        let cli = Cli::parse_from([
            "flowstore",
            "--flow",
            "/conf/flow.xml.gz",
            "--archive-dir",
            "/conf/history",
            "show",
        ]);
        let config = create_storage_config(&cli).unwrap();
        assert_eq!(config.flow_path, PathBuf::from("/conf/flow.xml.gz"));
        assert_eq!(config.archive_dir, Some(PathBuf::from("/conf/history")));
    }

    #[test]
    fn test_save_and_show_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let input = temp_dir.path().join("flow.xml");
        std::fs::write(&input, b"<flow/>").unwrap();
        let store = FlowConfigurationStore::open(temp_dir.path().join("flow.xml.gz")).unwrap();

        save_flow(&store, &input, true, false).unwrap();

        assert_eq!(store.load_bytes().unwrap(), b"<flow/>");
        assert_eq!(store.archives().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_by_file_name() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = FlowConfigurationStore::open(temp_dir.path().join("flow.xml.gz")).unwrap();
        let archived = store
            .save_document(&BytesSerializer(b"<flow>v1</flow>"), true)
            .unwrap()
            .unwrap();
        store
            .save_document(&BytesSerializer(b"<flow>v2</flow>"), false)
            .unwrap();

        restore_flow(&store, Path::new(archived.file_name().unwrap())).unwrap();

        assert_eq!(store.load_bytes().unwrap(), b"<flow>v1</flow>");
    }
}

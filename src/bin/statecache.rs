//! Operator CLI over the recovery console.

use clap::{Parser, Subcommand};
use statecache::{Cache, CacheConfig, CacheError, ExportDocument, Result, StorageKey};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "statecache", version, about = "Inspect and repair a local state cache")]
struct Cli {
    /// Directory holding the stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Key namespace (e.g. shopee)
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report primary and backup slots of every known key
    Inspect,

    /// Copy a key's backup slot over its primary slot
    Restore {
        /// Full key (e.g. shopee_sales_data)
        key: String,
    },

    /// Restore a collection key and push it into the record store
    RestoreCollection {
        /// Full key of the legacy mirror (e.g. shopee_tasks_def)
        key: String,
    },

    /// Write every known key into a dated JSON file
    Export {
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Load an exported JSON file back into storage
    Import {
        file: PathBuf,
    },

    /// Remove every backup slot
    ClearBackups {
        /// Skip confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn load_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_json_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    config.background_flush = false;
    Ok(config)
}

fn confirm(keys: &[StorageKey]) -> bool {
    println!("This will permanently remove the following backup slots:");
    for key in keys {
        println!("  {}", key);
    }
    print!("[Y] To delete: ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        Ok(_) => input.trim() == "Y",
        Err(_) => false,
    }
}

fn run(cli: Cli) -> Result<()> {
    let cache = Cache::open(load_config(&cli)?)?;
    let console = cache.console();
    console.discover()?;

    match cli.command {
        Commands::Inspect => {
            println!(
                "{:<32} {:>10} {:>7} {:>10} {:>7} {:>7}",
                "KEY", "PRIMARY B", "ITEMS", "BACKUP B", "ITEMS", "STORE"
            );
            for report in console.inspect() {
                let store = report
                    .store_items
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} {:>10} {:>7} {:>10} {:>7} {:>7}",
                    report.key.as_str(),
                    report.primary.bytes,
                    report.primary.items,
                    report.backup.bytes,
                    report.backup.items,
                    store
                );
            }
        }
        Commands::Restore { key } => {
            let items = console.restore_from_backup(&StorageKey::new(key.as_str()))?;
            println!("Restored {} ({} items). Reload the application.", key, items);
        }
        Commands::RestoreCollection { key } => {
            let records = console.restore_collection(&StorageKey::new(key.as_str()))?;
            println!("Restored {} ({} records). Reload the application.", key, records);
        }
        Commands::Export { out } => {
            let path = console.export_to_dir(&out)?;
            println!("Exported to {}", path.display());
        }
        Commands::Import { file } => {
            let document = ExportDocument::from_reader(BufReader::new(File::open(&file)?))?;
            let keys = console.import(&document)?;
            println!("Imported {} keys from {}", keys, file.display());
        }
        Commands::ClearBackups { yes } => {
            match console.clear_all_backups(|keys| yes || confirm(keys)) {
                Ok(0) => println!("No backup slots to remove."),
                Ok(count) => println!("Removed {} backup slots.", count),
                Err(CacheError::ConfirmationDeclined) => println!("Operation cancelled."),
                Err(e) => return Err(e),
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

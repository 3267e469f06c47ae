//! BlobKit CLI
//!
//! Command-line tools for BlobKit registries.
//!
//! # Commands
//!
//! - `backup` - Write every store into a zip archive
//! - `restore` - Replace store contents from an archive
//! - `verify` - Validate an archive without restoring it
//! - `info` - Print an archive's manifest summary
//! - `gc` - Garbage-collect content-addressed file stores

mod commands;

use blobkit_storage::{BackendKind, EncryptionKey, RegistryConfig, StoreRegistry};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// BlobKit command-line storage tools.
#[derive(Parser)]
#[command(name = "blobkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    registry: RegistryArgs,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How to open the registry.
#[derive(Args)]
struct RegistryArgs {
    /// Registry root directory
    #[arg(global = true, short, long)]
    root: Option<PathBuf>,

    /// File holding a raw 32-byte encryption key
    #[arg(global = true, long, conflicts_with = "passphrase")]
    key_file: Option<PathBuf>,

    /// Passphrase to derive the encryption key from
    #[arg(global = true, long, requires = "salt")]
    passphrase: Option<String>,

    /// Salt for passphrase derivation
    #[arg(global = true, long, requires = "passphrase")]
    salt: Option<String>,

    /// Backend for file stores (memory, flat, cas, lsm)
    #[arg(global = true, long, default_value = "cas")]
    file_backend: BackendKind,

    /// Backend for entity stores (memory, flat, cas, lsm)
    #[arg(global = true, long, default_value = "lsm")]
    entity_backend: BackendKind,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every store into a zip archive
    Backup {
        /// Archive to create
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace store contents from an archive
    Restore {
        /// Archive to restore from
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Validate an archive without restoring it
    Verify {
        /// Archive to validate
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Print an archive's manifest summary
    Info {
        /// Archive to read
        #[arg(short, long)]
        input: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Garbage-collect every content-addressed store
    Gc,

    /// Show version information
    Version,
}

impl RegistryArgs {
    fn encryption_key(&self) -> Result<Option<Arc<EncryptionKey>>, Box<dyn std::error::Error>> {
        if let Some(path) = &self.key_file {
            let bytes = std::fs::read(path)
                .map_err(|e| format!("Failed to read key file {}: {e}", path.display()))?;
            return Ok(Some(Arc::new(EncryptionKey::from_bytes(&bytes)?)));
        }
        match (&self.passphrase, &self.salt) {
            (Some(passphrase), Some(salt)) => Ok(Some(Arc::new(
                EncryptionKey::derive_from_password(passphrase.as_bytes(), salt.as_bytes())?,
            ))),
            _ => Ok(None),
        }
    }

    fn open(&self, command: &str) -> Result<StoreRegistry, Box<dyn std::error::Error>> {
        let root = self
            .root
            .as_deref()
            .ok_or_else(|| format!("Registry root required for {command}"))?;
        self.open_at(root)
    }

    fn open_at(&self, root: &Path) -> Result<StoreRegistry, Box<dyn std::error::Error>> {
        let mut config = RegistryConfig::new(root)
            .file_backend(self.file_backend)
            .entity_backend(self.entity_backend);
        if let Some(key) = self.encryption_key()? {
            config = config.encryption_key(key);
        }
        Ok(StoreRegistry::open(config)?)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Backup { output } => {
            let registry = cli.registry.open("backup")?;
            commands::backup::create(registry, &output)?;
        }
        Commands::Restore { input } => {
            let registry = cli.registry.open("restore")?;
            commands::backup::restore(registry, &input)?;
        }
        Commands::Verify { input } => {
            commands::backup::verify(&input)?;
        }
        Commands::Info { input, format } => {
            commands::backup::info(&input, &format)?;
        }
        Commands::Gc => {
            let registry = cli.registry.open("gc")?;
            commands::gc::run(&registry)?;
            registry.close()?;
        }
        Commands::Version => {
            println!("BlobKit CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

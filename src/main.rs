//! Binary entry point for shelfstore.
//!
//! A small maintenance CLI over the catalogue store: inspect, migrate,
//! rebuild the search index, search and purge.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use shelfstore::observability::{self, ObservabilityConfig, ObservabilityHandle};
use shelfstore::storage::schema::CURRENT_VERSION;
use shelfstore::{Book, CatalogueDb, StoreConfig, VersionStatus, inspect_version};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Shelfstore - maintenance tool for a book catalogue store.
#[derive(Parser)]
#[command(name = "shelfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "SHELFSTORE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to the catalogue database (overrides the configuration).
    #[arg(short, long, global = true, env = "SHELFSTORE_DATABASE")]
    database: Option<PathBuf>,

    /// Print a metrics snapshot when the command finishes.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the store's schema version without writing anything.
    Status,

    /// Open the store, creating or migrating it to the current schema.
    Migrate,

    /// Rebuild the full-text search index from the row store.
    RebuildIndex,

    /// Search the catalogue.
    Search {
        /// Words that must appear in an author name.
        #[arg(short, long)]
        author: Option<String>,

        /// Words that must appear in a title.
        #[arg(short, long)]
        title: Option<String>,

        /// Words that may appear anywhere; prefix a word with '-' to exclude it.
        #[arg(short, long)]
        keywords: Option<String>,
    },

    /// Remove authors and series no book refers to.
    Purge,
}

/// Main entry point.
fn main() -> ExitCode {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), cli.database.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let mut obs_config = ObservabilityConfig::from_store_config(&config, cli.verbose);
    obs_config.metrics.enabled |= cli.metrics;
    let observability = match observability::init(obs_config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    let result = run_command(cli.command, config);
    if cli.metrics {
        print_metrics(&observability);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(command: Commands, config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Status => cmd_status(&config),
        Commands::Migrate => cmd_migrate(config),
        Commands::RebuildIndex => cmd_rebuild_index(config),
        Commands::Search {
            author,
            title,
            keywords,
        } => cmd_search(config, author, title, keywords),
        Commands::Purge => cmd_purge(config),
    }
}

/// Loads configuration, then applies the database override.
fn load_config(
    path: Option<&Path>,
    database: Option<&Path>,
) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => StoreConfig::load_from_file(path)?,
        None => StoreConfig::load_default(),
    };
    Ok(match database {
        Some(database) => config.with_database_path(database),
        None => config,
    })
}

fn describe(status: VersionStatus) -> String {
    match status {
        VersionStatus::Empty => "empty (will be created on first open)".to_string(),
        VersionStatus::Current => format!("current (version {CURRENT_VERSION})"),
        VersionStatus::NeedsMigration(found) => {
            format!("version {found}, migration to {CURRENT_VERSION} pending")
        },
        VersionStatus::TooNew(found) => {
            format!("version {found}, newer than this build ({CURRENT_VERSION})")
        },
        VersionStatus::Legacy(found) => format!("version {found}, too old to migrate"),
    }
}

fn cmd_status(config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let status = inspect_version(&config.database_path)?;
    println!("Shelfstore Status");
    println!("=================");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Database: {}", config.database_path.display());
    println!("Schema: {}", describe(status));
    if !status.is_openable() {
        return Err(format!("store cannot be opened: {}", describe(status)).into());
    }
    Ok(())
}

fn cmd_migrate(config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let before = inspect_version(&config.database_path)?;
    let db = CatalogueDb::open(config)?;
    let after = db.schema_version()?;
    match before {
        VersionStatus::Current => println!("Already at version {after}"),
        VersionStatus::Empty => println!("Created store at version {after}"),
        VersionStatus::NeedsMigration(from) => println!("Migrated from version {from} to {after}"),
        VersionStatus::TooNew(_) | VersionStatus::Legacy(_) => {},
    }
    Ok(())
}

fn cmd_rebuild_index(config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = CatalogueDb::open(config)?;
    let indexed = db.session().rebuild_search_index()?;
    println!("Indexed {indexed} books");
    Ok(())
}

fn format_book(book: &Book) -> String {
    let authors: Vec<String> = book.authors.iter().map(|a| a.given_first()).collect();
    if authors.is_empty() {
        format!("{:>6}  {}", book.id, book.title)
    } else {
        format!("{:>6}  {} ({})", book.id, book.title, authors.join(", "))
    }
}

fn cmd_search(
    config: StoreConfig,
    author: Option<String>,
    title: Option<String>,
    keywords: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = CatalogueDb::open(config)?;
    let session = db.session();
    let ids = session.search_books(author.as_deref(), title.as_deref(), keywords.as_deref())?;
    if ids.is_empty() {
        println!("No books found");
        return Ok(());
    }
    for id in ids {
        if let Some(book) = session.get_book(id)? {
            println!("{}", format_book(&book));
        }
    }
    Ok(())
}

fn cmd_purge(config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = CatalogueDb::open(config)?;
    let counts = db.session().purge()?;
    println!(
        "Removed {} authors and {} series",
        counts.authors, counts.series
    );
    Ok(())
}

fn print_metrics(observability: &ObservabilityHandle) {
    match observability.metrics() {
        Some(handle) => print!("{}", handle.render()),
        None => eprintln!("Metrics recorder is not installed"),
    }
}

//! keystate: command-line access to a persisted state store.
//!
//! Every command goes through the same engine an application would use, so
//! filtering, change suppression and hydration behave identically.
//!
//! # Usage
//!
//! ```text
//! keystate --store app.redb set theme='"dark"' count=3
//! keystate --store app.redb dump --format json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

use commands::StoreOptions;

#[derive(Parser)]
#[command(
    name = "keystate",
    about = "Inspect and edit keystate stores",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Store file (overrides [persistence].path).
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// keystate.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Storage key prefix (overrides [persistence].key_prefix).
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value stored under a key
    Get { key: String },
    /// Assign one or more keys in a single batch.
    ///
    /// Values are parsed as JSON; anything that is not valid JSON is stored
    /// as a string.
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        assignments: Vec<String>,
    },
    /// Delete a key
    Remove { key: String },
    /// Print every key
    Dump {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Remove every key
    Clear,
    /// Delete the stored state slot entirely
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keystate=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = StoreOptions {
        store: cli.store,
        config: cli.config,
        prefix: cli.prefix,
    };
    let engine = commands::open(&options).await?;

    match cli.command {
        Commands::Get { key } => commands::store::get(&engine, &key),
        Commands::Set { assignments } => commands::store::set(&engine, &assignments).await,
        Commands::Remove { key } => commands::store::remove(&engine, &key).await,
        Commands::Dump { format } => commands::store::dump(&engine, &format),
        Commands::Clear => commands::store::clear(&engine).await,
        Commands::Purge => commands::store::purge(&engine).await,
    }
}

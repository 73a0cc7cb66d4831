//! dbwire-cli - Command-line interface for dbwire
//!
//! Runs one statement against a server or a replication group.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use dbwire_client::{BackoffPolicy, ConnectionConfig, Session};
use dbwire_replication::{FailoverManager, ReplicationConfig, SelectorRegistry};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbwire-cli")]
#[command(about = "Command-line interface for dbwire servers")]
#[command(version)]
struct Cli {
    /// Connection descriptor (key=value;...)
    #[arg(
        short,
        long,
        env = "DBWIRE_DESCRIPTOR",
        default_value = "server=127.0.0.1"
    )]
    descriptor: String,

    /// Replication group to connect through instead of the descriptor
    #[arg(short, long)]
    group: Option<String>,

    /// Replication config file (defaults to DBWIRE_REPLICATION_CONFIG)
    #[arg(long)]
    replication_config: Option<PathBuf>,

    /// Require a master endpoint when connecting through a group
    #[arg(long)]
    master: bool,

    /// Retry transient server errors with backoff
    #[arg(long)]
    retry: bool,

    /// Print rows as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Run a SQL statement
    Sql {
        /// Statement text
        query: String,

        /// Positional bind value (JSON, or a plain string); repeatable
        #[arg(short, long = "bind")]
        binds: Vec<String>,
    },

    /// Find rows or documents in a collection
    Find {
        /// Collection name
        collection: String,

        /// Schema containing the collection
        #[arg(short, long)]
        schema: Option<String>,

        /// Query the document model instead of tables
        #[arg(long)]
        document: bool,

        /// Filter expression
        #[arg(short = 'w', long = "where")]
        criteria: Option<String>,

        /// Fields to return
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Sort expression
        #[arg(short, long)]
        order: Option<String>,

        /// Sort descending
        #[arg(long)]
        desc: bool,

        /// Maximum rows to return
        #[arg(short, long)]
        limit: Option<u64>,

        /// Rows to skip
        #[arg(long, default_value = "0")]
        offset: u64,
    },

    /// Generate the stored password hash used by the baseline mechanism
    HashPassword {
        /// The password to hash
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // No server connection needed
    if let Commands::HashPassword { password } = &cli.command {
        println!("{}", hex::encode(dbwire_client::auth::password_hash(password)));
        return Ok(());
    }

    let mut session = connect(&cli).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!(session = %session.id(), peer = ?session.peer(), "Connected");
    if session.tls_downgraded() {
        eprintln!(
            "{}: server does not support TLS, connection is unencrypted",
            "Warning".yellow()
        );
    }

    let mut policy = cli
        .retry
        .then(|| BackoffPolicy::from_config(session.config()));

    let result = commands::execute(&mut session, cli.command, policy.as_mut(), cli.json).await;
    if let Some(policy) = &policy {
        let stats = policy.stats();
        if stats.delay_requests > 0 {
            eprintln!(
                "{} {} time(s), waited {:.1}s",
                "Retried".yellow(),
                stats.delay_requests,
                stats.total_delay.as_secs_f64()
            );
        }
    }

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            let _ = session.close().await;
            std::process::exit(1);
        }
    }

    session.close().await?;
    Ok(())
}

async fn connect(cli: &Cli) -> Result<Session, Box<dyn std::error::Error>> {
    match &cli.group {
        Some(group) => {
            let config = match &cli.replication_config {
                Some(path) => ReplicationConfig::from_file(path)?,
                None => ReplicationConfig::load()?,
            };
            let manager = FailoverManager::from_config(&config, &SelectorRegistry::default())?;
            Ok(manager.get_connection(group, cli.master, None).await?)
        }
        None => {
            let config = ConnectionConfig::from_descriptor(&cli.descriptor)?
                .with_client_name("dbwire-cli");
            Ok(Session::open(config).await?)
        }
    }
}

//! Collection assembler CLI
//!
//! # Usage
//!
//! ```bash
//! collection-assembler assemble --submission request.json --requested-by dev@corp.com
//! collection-assembler show 3f1c...
//! collection-assembler list --viewer dev@corp.com
//! collection-assembler withdraw 3f1c...
//! collection-assembler stats
//! ```

use anyhow::{bail, Context, Result};
use bridge::{Bridge, StorageConfig};
use clap::{Parser, Subcommand};
use log::{error, info};
use rule_engine::{
    AccessPolicy, AssemblyError, CollectionAssembler, CollectionCatalog, CollectionId,
    SubmissionInput,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "collection-assembler")]
#[command(version = "0.1.0")]
#[command(about = "Assembles firewall rule submissions into prioritized collections", long_about = None)]
struct Cli {
    /// Path to the collections database
    #[arg(long, env = "COLLECTION_DB", default_value = "./var/data/collections.db")]
    database: PathBuf,

    /// Comma-separated or JSON list of administrator emails
    #[arg(long, env = "ADMIN_EMAILS")]
    admin_emails: Option<String>,

    /// Comma-separated or JSON list of network administrator emails
    #[arg(long, env = "NETWORK_ADMIN_EMAILS")]
    network_admin_emails: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a submission file into a stored collection
    Assemble {
        /// JSON submission; `-` reads stdin
        #[arg(long, short)]
        submission: PathBuf,

        /// Overrides the submission's requested_by
        #[arg(long)]
        requested_by: Option<String>,
    },
    /// Print a stored collection document
    Show { id: String },
    /// List collections visible to a viewer
    List {
        /// Omit for an unrestricted operator listing
        #[arg(long)]
        viewer: Option<String>,
    },
    /// Withdraw a collection and release its fingerprints
    Withdraw { id: String },
    /// Ledger counts
    Stats,
}

#[derive(Serialize)]
struct AssembleOutput<'a> {
    collection_id: String,
    document_digest: &'a str,
    request_hash: Option<&'a str>,
    priorities: Vec<(String, u32)>,
    rule_ids: Vec<String>,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let bridge = Bridge::new(StorageConfig {
        database_path: cli.database.clone(),
        ..StorageConfig::default()
    })
    .context("opening collection database")?;
    let policy = AccessPolicy::from_settings(
        cli.admin_emails.as_deref(),
        cli.network_admin_emails.as_deref(),
    );

    match cli.command {
        Commands::Assemble {
            submission,
            requested_by,
        } => assemble(bridge, &submission, requested_by),
        Commands::Show { id } => {
            let id = parse_id(&id)?;
            match bridge.get_collection(&id)? {
                Some(stored) => {
                    info!("collection {} is {}", id, stored.status);
                    println!("{}", stored.record.document.to_json_pretty()?);
                    Ok(())
                }
                None => bail!("collection {} not found", id),
            }
        }
        Commands::List { viewer } => {
            let rows = bridge.list_collections(viewer.as_deref(), &policy)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Commands::Withdraw { id } => {
            let id = parse_id(&id)?;
            bridge
                .withdraw_collection(&id)
                .with_context(|| format!("withdrawing collection {}", id))?;
            println!("withdrawn {}", id);
            Ok(())
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&bridge.stats()?)?);
            Ok(())
        }
    }
}

fn assemble(bridge: Bridge, path: &PathBuf, requested_by: Option<String>) -> Result<()> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading submission from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading submission {}", path.display()))?
    };
    let mut input = SubmissionInput::from_json(&raw).context("parsing submission JSON")?;
    if let Some(email) = requested_by {
        input.requested_by = serde_json::Value::String(email);
    }

    let assembler = CollectionAssembler::new(bridge);
    let receipt = match assembler.assemble(&input) {
        Ok(receipt) => receipt,
        Err(AssemblyError::Validation(errors)) => {
            for violation in errors.violations() {
                eprintln!("  {}", violation);
            }
            bail!("submission rejected with {} violation(s)", errors.len());
        }
        Err(AssemblyError::Duplicate(duplicates)) => {
            for conflict in &duplicates.conflicts {
                eprintln!("  {}", conflict);
            }
            bail!("submission rejected: {} duplicate rule(s)", duplicates.conflicts.len());
        }
        Err(other) => return Err(other.into()),
    };

    let output = AssembleOutput {
        collection_id: receipt.collection_id.to_string(),
        document_digest: &receipt.document_digest,
        request_hash: receipt.request_hash.as_deref(),
        priorities: receipt
            .document
            .groups()
            .iter()
            .map(|g| (g.group_type.document_key().to_string(), g.priority.value()))
            .collect(),
        rule_ids: receipt.rule_ids().iter().map(ToString::to_string).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    println!("{}", receipt.document.to_json_pretty()?);
    Ok(())
}

fn parse_id(raw: &str) -> Result<CollectionId> {
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid collection id '{}': {}", raw, e))
}

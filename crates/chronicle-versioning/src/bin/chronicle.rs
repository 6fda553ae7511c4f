//! # chronicle
//!
//! Maintenance CLI for a chronicle audit trail: inspect audits, check and
//! repair validity end markers.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chronicle_core::AuditId;
use chronicle_core::logging::init_subscriber;
use chronicle_settings::get_settings;
use chronicle_versioning::sqlite::repositories::{AuditRepo, ChangesRepo, MetaRepo};
use chronicle_versioning::sqlite::{ConnectionConfig, applied_objects, new_file};
use chronicle_versioning::{ValidityColumns, update_end_tx_column_with, verify_chains};
use clap::{Parser, Subcommand};

/// Chronicle audit trail maintenance.
#[derive(Parser, Debug)]
#[command(name = "chronicle", about = "Chronicle audit trail maintenance")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recompute every end marker of a version table.
    Repair {
        /// Version table name, e.g. `article_version`.
        table: String,
    },
    /// Report rows whose end marker disagrees with their chain.
    Verify {
        /// Version table name.
        table: String,
    },
    /// List recent audits.
    Audits {
        /// Number of audits to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show the entity types and tags of one audit.
    Show {
        /// Audit id.
        id: i64,
    },
    /// List applied schema objects.
    Schema,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = get_settings();
    init_subscriber(&settings.logging.level, settings.logging.json);

    let path = cli
        .db
        .or_else(|| settings.database.path.as_ref().map(PathBuf::from))
        .context("no database path: pass --db or set CHRONICLE_DB_PATH")?;
    if !path.exists() {
        bail!("database not found: {}", path.display());
    }
    let config = ConnectionConfig {
        pool_size: 1,
        ..ConnectionConfig::from(&settings.database)
    };
    let pool = new_file(&path.to_string_lossy(), &config)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let conn = pool.get()?;
    let names = &settings.versioning;

    match cli.command {
        Command::Repair { table } => {
            let report = update_end_tx_column_with(&conn, &table, &ValidityColumns::from(names))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Verify { table } => {
            let violations = verify_chains(&conn, &table, &ValidityColumns::from(names))?;
            println!("{}", serde_json::to_string_pretty(&violations)?);
            if !violations.is_empty() {
                bail!("{} row(s) in {table} have inconsistent end markers", violations.len());
            }
        }
        Command::Audits { limit } => {
            for audit in AuditRepo::latest(&conn, &names.audit_table, limit)? {
                println!("{audit}");
            }
        }
        Command::Show { id } => {
            let id = AuditId::new(id);
            let audit = AuditRepo::get(&conn, &names.audit_table, id)?
                .with_context(|| format!("audit {id} not found"))?;
            println!("{audit}");
            let changes = ChangesRepo::for_audit(&conn, &names.changes_table, id)?;
            println!("changes: {}", changes.join(", "));
            for row in MetaRepo::list(&conn, &names.meta_table, id)? {
                println!("  {} = {}", row.key, row.value);
            }
        }
        Command::Schema => {
            for object in applied_objects(&conn)? {
                println!(
                    "{}  {}  {}",
                    object.applied_at,
                    object.name,
                    object.description.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

//! Audit Ledger CLI
//!
//! Exit status: 0 on success (and verified integrity), 1 when the ledger's
//! integrity is broken, 2 when the operation itself failed.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use audit_ledger::audit::{
    generate_merkle_proof, AuditLedger, EntryFilter, ReportFormat, VerificationResult,
};
use audit_ledger::{logging, LedgerConfig};

const EXIT_INTEGRITY_BROKEN: u8 = 1;
const EXIT_FAILURE: u8 = 2;

#[derive(Parser)]
#[command(name = "audit-ledger")]
#[command(about = "Append-only, hash-chained audit ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ledger file (overrides configuration)
    #[arg(short, long, global = true)]
    ledger: Option<PathBuf>,

    /// Configuration file (default: ./audit-ledger.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty ledger (no-op if it already exists)
    Init,

    /// Append one event
    Append {
        /// Event type tag (free-form)
        event_type: String,

        /// Payload as a JSON object, or `-` to read it from stdin
        payload: String,
    },

    /// Verify the hash chain
    Verify {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a report of every entry plus the integrity verdict
    Export {
        /// Output file
        destination: PathBuf,

        /// Report format (default from configuration)
        #[arg(short, long, value_enum)]
        format: Option<ReportFormat>,
    },

    /// List entries
    List {
        /// Only entries of this event type
        #[arg(short = 't', long)]
        event_type: Option<String>,

        /// Only entries at or after this RFC 3339 instant
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only entries at or before this RFC 3339 instant
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Print one entry as JSON
    Show {
        sequence: u64,
    },

    /// Print entry count and chain head
    Status,

    /// Print a Merkle inclusion proof for one entry
    Proof {
        sequence: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    logging::init(&config.log_filter);

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load_config(cli: &Cli) -> Result<LedgerConfig> {
    let mut config =
        LedgerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(ledger) = &cli.ledger {
        config.ledger_path = ledger.clone();
    }
    Ok(config)
}

async fn run(command: Commands, config: LedgerConfig) -> Result<ExitCode> {
    let ledger = AuditLedger::from_config(&config);

    match command {
        Commands::Init => {
            let path = ledger.store().path().display();
            if ledger.init().await? {
                println!("Initialized empty ledger at {}", path);
            } else {
                println!("Ledger already initialized at {}", path);
            }
        }

        Commands::Append {
            event_type,
            payload,
        } => {
            let raw = if payload == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read payload from stdin")?;
                buf
            } else {
                payload
            };

            let entry = ledger
                .submit_json(&event_type, &raw)
                .await
                .context("Append rejected")?;
            println!("{}", entry.summary());
            println!("digest: {}", entry.entry_digest);
        }

        Commands::Verify { json } => {
            let result = ledger.verify()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_verification(&result);
            }
            return Ok(integrity_exit(&result));
        }

        Commands::Export {
            destination,
            format,
        } => {
            let format = format.unwrap_or(config.report_format);
            let report = ledger.export(&destination, format)?;
            println!(
                "Exported {} entries to {} ({})",
                report.verification.entry_count,
                destination.display(),
                report.verification.summary()
            );
            return Ok(integrity_exit(&report.verification));
        }

        Commands::List {
            event_type,
            since,
            until,
        } => {
            let filter = EntryFilter {
                event_type,
                since,
                until,
            };
            let entries = ledger.store().query(&filter)?;
            for entry in &entries {
                println!(
                    "{:>6}  {}  {}",
                    entry.sequence,
                    entry.timestamp.to_rfc3339(),
                    entry.event_type
                );
            }
            info!("Listed {} entries", entries.len());
        }

        Commands::Show { sequence } => {
            let entry = ledger
                .store()
                .get(sequence)?
                .ok_or_else(|| anyhow!("No entry with sequence {}", sequence))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }

        Commands::Status => {
            let count = ledger.store().count()?;
            println!("Ledger:      {}", ledger.store().path().display());
            println!("Entries:     {}", count);
            match ledger.head()? {
                Some(head) => {
                    println!("Head:        #{} {}", head.sequence, head.entry_digest);
                    println!("Last event:  {} at {}", head.event_type, head.timestamp.to_rfc3339());
                }
                None => println!("Head:        genesis (empty ledger)"),
            }
        }

        Commands::Proof { sequence } => {
            let entries = ledger.entries()?;
            let position = entries
                .iter()
                .position(|entry| entry.sequence == sequence)
                .ok_or_else(|| anyhow!("No entry with sequence {}", sequence))?;
            let proof = generate_merkle_proof(&entries, position)
                .ok_or_else(|| anyhow!("Cannot build proof for sequence {}", sequence))?;
            println!("{}", serde_json::to_string_pretty(&proof)?);
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_verification(result: &VerificationResult) {
    println!("{}", result.summary());
    if !result.valid {
        if let Some(detail) = &result.detail {
            println!("  detail: {}", detail);
        }
    }
    println!("  head digest: {}", result.head_digest);
}

fn integrity_exit(result: &VerificationResult) -> ExitCode {
    if result.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INTEGRITY_BROKEN)
    }
}

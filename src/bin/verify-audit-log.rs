use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

use audit_ledger::audit::{merkle_root, verify_merkle_root, verify_scan, Digest, LedgerStore};
use audit_ledger::config::DEFAULT_LOG_FILTER;
use audit_ledger::logging;

const EXIT_INTEGRITY_BROKEN: u8 = 1;
const EXIT_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Independently verify an audit ledger file")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .help("Path to the ledger file")
                .required(true),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root (64 hex characters)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let log_path = matches
        .get_one::<String>("log-path")
        .cloned()
        .unwrap_or_default();
    let expected_root = matches.get_one::<String>("merkle-root").cloned();
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    logging::init(match (quiet, verbose) {
        (true, _) => "error",
        (_, true) => "audit_ledger=debug",
        _ => DEFAULT_LOG_FILTER,
    });

    match verify_ledger(&log_path, expected_root.as_deref(), verbose) {
        Ok(true) => {
            if !quiet {
                println!("Ledger verification completed successfully");
            }
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::from(EXIT_INTEGRITY_BROKEN),
        Err(e) => {
            error!("Ledger verification failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Returns `Ok(false)` when the ledger is readable but its integrity is broken.
fn verify_ledger(log_path: &str, expected_root: Option<&str>, verbose: bool) -> Result<bool> {
    info!("Verifying ledger: {}", log_path);

    if !Path::new(log_path).is_file() {
        return Err(anyhow!("Ledger file not found: {}", log_path));
    }
    let expected_root = expected_root
        .map(|hex| hex.parse::<Digest>().map_err(|e| anyhow!("Invalid --merkle-root {:?}: {}", hex, e)))
        .transpose()?;

    let store = LedgerStore::new(log_path, false);
    let scan = store.scan()?;
    let result = verify_scan(&scan);

    if !result.valid {
        println!("{}", result.summary());
        if let Some(detail) = &result.detail {
            println!("  detail: {}", detail);
        }
        return Ok(false);
    }

    let entries = scan.leading_entries();
    if verbose {
        println!("{}", result.summary());
    }

    let root = merkle_root(&entries);
    if let Some(expected) = &expected_root {
        info!("Verifying Merkle root against expected value");
        if !verify_merkle_root(&entries, expected) {
            println!(
                "Merkle root mismatch. Expected: {}, Got: {}",
                expected,
                root.map(|r| r.to_hex()).unwrap_or_else(|| "<empty ledger>".to_string())
            );
            return Ok(false);
        }
        if verbose {
            println!("Merkle root matches expected value");
        }
    }

    if verbose {
        print_summary(&entries, root);
    }
    Ok(true)
}

fn print_summary(entries: &[audit_ledger::LedgerEntry], root: Option<Digest>) {
    println!("\nLedger Summary:");
    println!("  Total entries: {}", entries.len());
    if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
        println!("  First entry: {}", first.timestamp.to_rfc3339());
        println!("  Last entry: {}", last.timestamp.to_rfc3339());
        println!("  Head digest: {}", last.entry_digest);
    }
    if let Some(root) = root {
        println!("  Merkle root: {}", root);
    }

    let mut event_types: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *event_types.entry(entry.event_type.as_str()).or_insert(0) += 1;
    }

    println!("\nEvent type distribution:");
    for (event_type, count) in event_types {
        println!("  {}: {}", event_type, count);
    }
}

//! Operator CLI for the briefmeter ledger.
//!
//! Reads service configuration from the environment (see
//! `MeterConfig::from_env`) and talks to the configured backend directly.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use briefmeter::cost::{CostInput, SourceKind};
use briefmeter::pow::check_solution;
use briefmeter::{Meter, MeterConfig};

#[derive(Parser)]
#[command(name = "briefmeter", about = "Credit ledger and top-up reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mint an account with an API key (requires ADMIN_TOKEN).
    CreateKey {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 0)]
        credits: i64,
    },
    /// Enable or disable an account (requires ADMIN_TOKEN).
    SetDisabled {
        #[arg(long)]
        account: String,
        #[arg(long)]
        disabled: bool,
    },
    /// Price and debit one ingestion request.
    Charge {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "text")]
        kind: String,
        #[arg(long)]
        mimetype: Option<String>,
        #[arg(long, default_value_t = 0)]
        bytes: i64,
        #[arg(long, default_value_t = 0)]
        pages: i64,
        #[arg(long, default_value_t = 0)]
        chars: i64,
        #[arg(long, default_value_t = 0)]
        pixels: i64,
    },
    /// Show the most recent usage events for an account.
    Usage {
        #[arg(long)]
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Create a top-up invoice and print the deposit instructions.
    Invoice {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "USDC")]
        asset: String,
        #[arg(long)]
        units: f64,
    },
    /// Look up an invoice owned by an account.
    InvoiceStatus {
        #[arg(long)]
        account: String,
        #[arg(long = "ref")]
        invoice_ref: String,
    },
    /// Replay a webhook delivery from a JSON file (requires TOPUP_WEBHOOK_SECRET).
    Ingest {
        #[arg(long)]
        payload: std::path::PathBuf,
    },
    /// Confirm an invoice against a transaction hash (requires ADMIN_TOKEN).
    Confirm {
        #[arg(long = "ref")]
        invoice_ref: String,
        #[arg(long)]
        tx: String,
    },
    /// Link a stored payment to an invoice after checking its terms
    /// (requires ADMIN_TOKEN).
    MatchPayment {
        #[arg(long = "ref")]
        invoice_ref: String,
        #[arg(long)]
        tx: String,
    },
    /// Issue a signup challenge, optionally brute-forcing a nonce locally.
    Pow {
        #[arg(long)]
        solve: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = MeterConfig::from_env()?;
    let meter = Meter::open(config).await?;
    let admin_token = std::env::var("ADMIN_TOKEN").ok();

    match cli.command {
        Command::CreateKey { name, credits } => {
            let (account, api_key) = meter
                .create_account(admin_token.as_deref(), &name, credits)
                .await?;
            println!("account: {}", account.id);
            println!("credits: {}", account.credits);
            // Shown once; only the hash is stored.
            println!("api key: {api_key}");
        }
        Command::SetDisabled { account, disabled } => {
            meter
                .set_account_disabled(admin_token.as_deref(), &account, disabled)
                .await?;
            println!("{account}: disabled={disabled}");
        }
        Command::Charge {
            account,
            kind,
            mimetype,
            bytes,
            pages,
            chars,
            pixels,
        } => {
            let input = CostInput {
                source_kind: parse_kind(&kind),
                mimetype,
                bytes,
                pages,
                text_chars: chars,
                pixels,
            };
            let receipt = meter.charge(&account, &input, Some("cli")).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Usage { account, limit } => {
            let events = meter.usage(&account, limit).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Invoice {
            account,
            asset,
            units,
        } => {
            let quote = meter.create_invoice(&account, &asset, units).await?;
            println!("{}", serde_json::to_string_pretty(&quote)?);
        }
        Command::InvoiceStatus {
            account,
            invoice_ref,
        } => {
            let invoice = meter.invoice_status(&account, &invoice_ref).await?;
            println!("{}", serde_json::to_string_pretty(&invoice)?);
        }
        Command::Ingest { payload } => {
            let raw = tokio::fs::read_to_string(&payload).await?;
            let payload: serde_json::Value = serde_json::from_str(&raw)?;
            let secret = std::env::var("TOPUP_WEBHOOK_SECRET").ok();
            let results = meter.ingest_webhook(secret.as_deref(), &payload).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Confirm { invoice_ref, tx } => {
            let outcome = meter
                .manual_confirm(admin_token.as_deref(), &invoice_ref, &tx)
                .await?;
            println!("invoice: {}", outcome.invoice.invoice_ref);
            println!("balance: {}", outcome.balance);
            println!("already confirmed: {}", outcome.already_confirmed);
        }
        Command::MatchPayment { invoice_ref, tx } => {
            let outcome = meter
                .manual_match(admin_token.as_deref(), &invoice_ref, &tx)
                .await?;
            println!("invoice: {}", outcome.invoice.invoice_ref);
            println!("balance: {}", outcome.balance);
        }
        Command::Pow { solve } => {
            let challenge = meter.issue_challenge()?;
            println!("token: {}", challenge.token);
            println!("difficulty: {}", challenge.difficulty);
            println!("expires at (ms): {}", challenge.expires_at_ms);
            if solve {
                let nonce = (0u64..)
                    .map(|n| n.to_string())
                    .find(|n| check_solution(&challenge.id, n, challenge.difficulty))
                    .unwrap_or_default();
                println!("nonce: {nonce}");
            }
        }
    }
    Ok(())
}

fn parse_kind(raw: &str) -> SourceKind {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" => SourceKind::Text,
        "url" => SourceKind::Url,
        "file" => SourceKind::File,
        _ => SourceKind::Unknown,
    }
}

//! Command-line definition for the `rater-ledger` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Token ledger service and admin tool.
#[derive(Parser, Debug)]
#[command(name = "rater-ledger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "rater_ledger=info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Override `gateway.host`.
        #[arg(long)]
        host: Option<String>,
        /// Override `gateway.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a free account and print its API key.
    Register { email: String },
    /// Show an account's balance. ACCOUNT is `id:`, `email:`, `key:` or a bare email/id.
    Balance { account: String },
    /// Show where an account sits in its refill cycle.
    Status { account: String },
    /// Debit tokens.
    Consume { account: String, amount: u64 },
    /// Add tokens.
    Credit {
        account: String,
        amount: u64,
        /// Count the tokens as purchased so refills never reset them.
        #[arg(long)]
        purchased: bool,
    },
    /// Apply the monthly refill if it is due.
    Refill { account: String },
    /// Move an account to another tier (free, premium, pro).
    Upgrade { account: String, tier: String },
    /// List purchasable packages.
    Packages,
    /// Print a signature header for a payload file, for replaying webhooks locally.
    Sign {
        /// JSON payload to sign.
        payload: PathBuf,
    },
}

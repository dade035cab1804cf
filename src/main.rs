//! rater-ledger entry point.

mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{Cli, Command};
use rater_ledger::billing::{AccountRef, Tier, TokenCredit, PACKAGES};
use rater_ledger::config::StoreBackend;
use rater_ledger::gateway::{self, Services};
use rater_ledger::webhook::signature;
use rater_ledger::Config;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    tracing::debug!(path = %config.config_path.display(), "config loaded");

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tracing::info!("rater-ledger v{}", env!("CARGO_PKG_VERSION"));
            gateway::run_gateway(config).await
        }
        Command::Packages => {
            for package in PACKAGES {
                let credit = match package.credit {
                    TokenCredit::Tokens(n) => format!("{n} tokens"),
                    TokenCredit::Unlimited => "unlimited".to_string(),
                };
                println!(
                    "{:<14} {:<18} ${}.{:02}  {credit}",
                    package.id,
                    package.name,
                    package.price_cents / 100,
                    package.price_cents % 100
                );
            }
            Ok(())
        }
        Command::Sign { payload } => {
            let secret = config
                .webhook
                .secret
                .as_deref()
                .context("webhook.secret (or RATER_WEBHOOK_SECRET) is not set")?;
            let body = std::fs::read(&payload)
                .with_context(|| format!("Failed to read {}", payload.display()))?;
            println!("{}", signature::sign(secret, &body, Utc::now().timestamp())?);
            Ok(())
        }
        command => run_admin(&config, command).await,
    }
}

/// One-shot ledger operations against the configured store.
async fn run_admin(config: &Config, command: Command) -> Result<()> {
    if config.store.backend == StoreBackend::Memory {
        tracing::warn!("memory backend: changes made by this command are discarded on exit");
    }
    let services = Services::from_config(config)?;
    let ledger = &services.ledger;
    let now = Utc::now();

    match command {
        Command::Register { email } => print_json(&ledger.register(&email, now).await?)?,
        Command::Balance { account } => {
            print_json(&ledger.get_balance(&AccountRef::parse(&account)).await?)?;
        }
        Command::Status { account } => {
            print_json(&ledger.refill_status(&AccountRef::parse(&account), now).await?)?;
        }
        Command::Consume { account, amount } => {
            print_json(&ledger.consume(&AccountRef::parse(&account), amount, now).await?)?;
        }
        Command::Credit {
            account,
            amount,
            purchased,
        } => {
            let view = ledger
                .credit(&AccountRef::parse(&account), amount, purchased, now)
                .await?;
            print_json(&view)?;
        }
        Command::Refill { account } => {
            print_json(&ledger.refill_if_due(&AccountRef::parse(&account), now).await?)?;
        }
        Command::Upgrade { account, tier } => {
            let tier: Tier = tier.parse()?;
            print_json(&ledger.upgrade_tier(&AccountRef::parse(&account), tier, now).await?)?;
        }
        Command::Serve { .. } | Command::Packages | Command::Sign { .. } => {}
    }

    services.shutdown().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

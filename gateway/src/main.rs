//! CLI entry point for the optiondesk broker gateway.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use optiondesk::{Price, Symbol};
use optiondesk_broker::ibkr::IbkrConnector;
use optiondesk_gateway::{Config, Gateway, ScanRequest};

#[derive(Parser)]
#[command(name = "optiondesk")]
#[command(about = "Options desk gateway: Interactive Brokers sessions, quotes, scanner, paper orders")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the configured ports and print connectivity
    Status,

    /// Snapshot quote for a stock
    Quote {
        symbol: String,
    },

    /// Recent daily bars for a stock
    Bars {
        symbol: String,

        #[arg(long, default_value_t = 20)]
        count: usize,
    },

    /// Option contracts around a reference price
    Chain {
        symbol: String,

        /// Reference price in dollars
        #[arg(long)]
        price: f64,

        #[arg(long, default_value_t = 7)]
        dte_min: u32,

        #[arg(long, default_value_t = 45)]
        dte_max: u32,
    },

    /// Run the market scanner
    Scan {
        /// Scan codes (config defaults when omitted)
        codes: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show current positions
    Positions,

    /// Show account values
    Account,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_symbol(raw: &str) -> anyhow::Result<Symbol> {
    Symbol::normalize(raw).with_context(|| format!("invalid symbol '{raw}'"))
}

async fn run(gateway: &Gateway, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let status = gateway.check_connectivity().await;
            print_json(&status)?;
            print_json(&gateway.get_runtime_status())?;
        }
        Command::Quote { symbol } => {
            let quote = gateway.get_quote(parse_symbol(&symbol)?).await?;
            print_json(&quote)?;
        }
        Command::Bars { symbol, count } => {
            let bars = gateway
                .get_recent_daily_bars(parse_symbol(&symbol)?, count)
                .await?;
            print_json(&bars)?;
        }
        Command::Chain {
            symbol,
            price,
            dte_min,
            dte_max,
        } => {
            let reference = Price::from_f64(price).context("price must be a finite number")?;
            let contracts = gateway
                .get_option_contracts(parse_symbol(&symbol)?, reference, dte_min, dte_max)
                .await?;
            for contract in &contracts {
                println!("{contract}");
            }
            println!("{} contracts", contracts.len());
        }
        Command::Scan { codes, limit } => {
            let request = ScanRequest {
                scan_codes: codes,
                limit,
                ..ScanRequest::default()
            };
            print_json(&gateway.get_scanner_symbols_with_source(&request).await)?;
        }
        Command::Positions => {
            print_json(&gateway.get_positions_snapshot().await?)?;
        }
        Command::Account => {
            print_json(&gateway.get_account_snapshot().await?)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let gateway = match Gateway::builder(config)
        .connector(Arc::new(IbkrConnector))
        .build()
    {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let result = run(&gateway, cli.command).await;
    gateway.shutdown().await;

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

//! RateBridge CLI
//!
//! Evaluates rate rules against the configured sources and formats amounts.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratebridge_common::CurrencyTable;
use ratebridge_fx::EngineConfig;

mod commands;

/// RateBridge CLI
#[derive(Parser, Debug)]
#[command(name = "ratebridge")]
#[command(about = "Currency rate aggregation from exchange quotes")]
struct Args {
    /// JSON configuration file (defaults to environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve currency pairs through a rule file
    Rates {
        /// File of `PATTERN = expr;` rules
        #[arg(short, long)]
        rules: PathBuf,

        /// Rule used for pairs no rule matches
        #[arg(long, default_value = "coingecko(X_X)")]
        default_rule: String,

        /// Relative spread applied to every rate, e.g. 0.01
        #[arg(long)]
        spread: Option<Decimal>,

        /// Do not fill the caches
        #[arg(long)]
        preview: bool,

        /// Pairs such as BTC_USD or ETH/EUR
        #[arg(required = true)]
        pairs: Vec<String>,
    },

    /// Format an amount for display
    Format {
        #[arg(allow_hyphen_values = true)]
        amount: Decimal,
        code: String,
    },

    /// List registered sources
    Sources,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => EngineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::from_env(),
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    if !CurrencyTable::init(config.extra_cryptos.iter()) {
        info!("Currency table was already initialized");
    }

    let output = match args.command {
        Command::Rates {
            rules,
            default_rule,
            spread,
            preview,
            pairs,
        } => {
            let rules_text = std::fs::read_to_string(&rules)?;
            let request = commands::RatesRequest {
                rules_text,
                default_rule,
                spread,
                preview,
                pairs,
            };
            commands::rates(&config, request).await?
        }
        Command::Format { amount, code } => commands::format(amount, &code),
        Command::Sources => commands::sources(&config)?,
    };

    println!("{output}");
    Ok(())
}

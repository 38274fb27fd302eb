//! cartsync CLI - drive the cart sync engine from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Load the cart (cached copy first, then the service)
//! cartsync show
//!
//! # Add two units of a product
//! cartsync add prod-42 -q 2 --name "Dried Pineapple" --price 12.50
//!
//! # Change or remove a line
//! cartsync set line-7 3
//! cartsync remove line-7
//!
//! # Empty the cart
//! cartsync clear
//!
//! # Session
//! cartsync login <token>
//! cartsync logout
//! cartsync status
//! cartsync checkout
//! ```
//!
//! Every command prints the resulting cart and sync state as JSON on stdout.
//! Logs go to stderr.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::process::ExitCode;

use cartsync::{CartSession, SyncConfig};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::CliError;

#[derive(Parser)]
#[command(name = "cartsync")]
#[command(author, version, about = "Resilient cart sync from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and print the cart
    Show,
    /// Add units of a product
    Add {
        /// Product ID
        product: String,

        /// Units to add (clamped to 1..=99)
        #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
        quantity: i64,

        /// Display name used if the change is applied locally
        #[arg(long)]
        name: Option<String>,

        /// Unit price used if the change is applied locally
        #[arg(long)]
        price: Option<Decimal>,
    },
    /// Set a line's quantity
    Set {
        /// Line ID
        line: String,

        /// New quantity (clamped to 1..=99)
        #[arg(allow_negative_numbers = true)]
        quantity: i64,
    },
    /// Remove a line
    Remove {
        /// Line ID
        line: String,
    },
    /// Remove every line
    Clear,
    /// Store a credential and reload the cart
    Login {
        /// Bearer token
        token: String,
    },
    /// Forget the credential and stop acquiring new ones
    Logout,
    /// Print credential and cache status without contacting the service
    Status,
    /// Check that the cart can proceed to checkout
    Checkout,
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &SyncConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

fn init_tracing() {
    // Defaults to info level for our crates if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cartsync=info,cartsync_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration is needed before Sentry, and Sentry before tracing
    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            commands::report_failure(&CliError::from(e));
            return ExitCode::from(2);
        }
    };
    let _sentry_guard = init_sentry(&config);
    init_tracing();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Command failed: {e}");
            commands::report_failure(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli, config: SyncConfig) -> Result<(), CliError> {
    let session = CartSession::new(config)?;

    match cli.command {
        Commands::Show => commands::cart::show(&session).await,
        Commands::Add {
            product,
            quantity,
            name,
            price,
        } => commands::cart::add(&session, &product, quantity, name, price).await,
        Commands::Set { line, quantity } => {
            commands::cart::set_quantity(&session, &line, quantity).await
        }
        Commands::Remove { line } => commands::cart::remove(&session, &line).await,
        Commands::Clear => commands::cart::clear(&session).await,
        Commands::Login { token } => commands::session::login(&session, &token).await,
        Commands::Logout => commands::session::logout(&session),
        Commands::Status => commands::session::status(&session),
        Commands::Checkout => commands::session::checkout(&session).await,
    }
}

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use configuration::{Config, LoggingSettings};
use core_types::{
    BalanceSyncResult, CredentialSummary, Exchange, TransactionFilter, TransactionSyncResult,
    TransactionType,
};
use database::{PgCredentialStore, connect, run_migrations};
use engine::{CancellationToken, ExchangeSyncService};
use envelope::MasterKey;
use indicatif::ProgressStyle;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::Arc;
use tracing::Instrument;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_indicatif::IndicatifLayer;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Entry point for the vaultsync command-line tool.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets such as DATABASE_URL and the master key may live in a .env file.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("Failed to read .env file");
        }
    }

    let cli = Cli::parse();
    let config = configuration::load_config().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging)?;

    // `keygen` is the only command that needs neither the database nor a key.
    if let Commands::Keygen = cli.command {
        println!("{}", MasterKey::generate().to_base64());
        eprintln!(
            "Store this value in the {} environment variable. Losing it makes every stored credential unreadable.",
            config.vault.master_key_env
        );
        return Ok(());
    }

    let service = build_service(&config).await?;

    // Ctrl-C cancels the running sync; nothing is written for a cancelled run.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling sync.");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Connect(args) => handle_connect(&service, args).await,
        Commands::Disconnect(args) => handle_disconnect(&service, args).await,
        Commands::List(args) => handle_list(&service, args).await,
        Commands::Balances(args) => handle_balances(&service, args, &cancel).await,
        Commands::Transactions(args) => handle_transactions(&service, args, &cancel).await,
        Commands::SyncAll(args) => handle_sync_all(&service, args, &cancel).await,
        Commands::Keygen => Ok(()),
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Read-only exchange credential vault and portfolio sync.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a read-only API key and store it encrypted.
    Connect(ConnectArgs),
    /// Delete a stored credential.
    Disconnect(ExchangeArgs),
    /// List the exchanges a user has connected.
    List(UserArgs),
    /// Sync and print the balances held on one exchange.
    Balances(OutputExchangeArgs),
    /// Sync and print the transaction history of one exchange.
    Transactions(TransactionArgs),
    /// Sync balances across every connected exchange.
    SyncAll(OutputUserArgs),
    /// Generate a new base64 master key.
    Keygen,
}

#[derive(Parser)]
struct UserArgs {
    /// The user that owns the credentials.
    #[arg(long)]
    user: String,
}

#[derive(Parser)]
struct OutputUserArgs {
    #[command(flatten)]
    user: UserArgs,

    /// Print the raw result as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ExchangeArgs {
    #[arg(long)]
    user: String,

    #[arg(long, value_enum)]
    exchange: Exchange,
}

#[derive(Parser)]
struct OutputExchangeArgs {
    #[command(flatten)]
    target: ExchangeArgs,

    /// Print the raw result as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ConnectArgs {
    #[command(flatten)]
    target: ExchangeArgs,

    /// The API key. For Coinbase, the key name (`organizations/.../apiKeys/...`).
    #[arg(long)]
    api_key: String,

    /// The API secret. Read from stdin when omitted so it stays out of shell history.
    #[arg(long)]
    api_secret: Option<String>,
}

#[derive(Parser)]
struct TransactionArgs {
    #[command(flatten)]
    output: OutputExchangeArgs,

    /// Earliest date to include (format: YYYY-MM-DD).
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Latest date to include (format: YYYY-MM-DD).
    #[arg(long)]
    until: Option<NaiveDate>,

    /// Only these transaction types. Repeatable.
    #[arg(long = "type", value_enum)]
    types: Vec<TransactionType>,

    /// Only these assets (e.g. BTC). Repeatable.
    #[arg(long = "asset")]
    assets: Vec<String>,
}

impl TransactionArgs {
    fn filter(&self) -> anyhow::Result<TransactionFilter> {
        let since = self
            .since
            .map(|date| date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()))
            .map(|dt| dt.context("Invalid --since date"))
            .transpose()?;
        let until = self
            .until
            .map(|date| date.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc()))
            .map(|dt| dt.context("Invalid --until date"))
            .transpose()?;
        if let (Some(since), Some(until)) = (since, until) {
            anyhow::ensure!(since <= until, "--since must not be after --until");
        }

        Ok(TransactionFilter {
            since,
            until,
            types: (!self.types.is_empty())
                .then(|| self.types.iter().copied().collect::<HashSet<_>>()),
            assets: (!self.assets.is_empty()).then(|| {
                self.assets
                    .iter()
                    .map(|asset| asset.trim().to_ascii_uppercase())
                    .collect::<HashSet<_>>()
            }),
        })
    }
}

// ==============================================================================
// Setup
// ==============================================================================

/// Logs go to stderr through the progress-bar layer, and to a daily file
/// when a log directory is configured.
fn init_logging(settings: &LoggingSettings) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .context("Invalid log filter")?;
    let indicatif_layer = IndicatifLayer::new();

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(guard)
}

async fn build_service(config: &Config) -> anyhow::Result<ExchangeSyncService> {
    let material = config.vault.master_key_material()?;
    let master_key =
        MasterKey::from_base64(&material).context("The configured master key is not usable")?;

    let pool = connect().await.context("Failed to connect to the database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    let store = Arc::new(PgCredentialStore::new(pool));

    Ok(ExchangeSyncService::from_config(config, store, master_key)?)
}

fn read_secret_from_stdin() -> anyhow::Result<String> {
    eprintln!("Paste the API secret, then press Enter (multi-line PEM keys end with an empty line):");
    let stdin = std::io::stdin();
    let mut secret = String::new();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read the API secret")?;
        if line.trim().is_empty() && !secret.is_empty() {
            break;
        }
        secret.push_str(&line);
        secret.push('\n');
        // Single-line secrets end at the first line.
        if !secret.starts_with("-----BEGIN") {
            break;
        }
    }
    Ok(secret.trim().to_string())
}

// ==============================================================================
// Command Handlers
// ==============================================================================

async fn handle_connect(service: &ExchangeSyncService, args: ConnectArgs) -> anyhow::Result<()> {
    let secret = match args.api_secret {
        Some(secret) => secret,
        None => read_secret_from_stdin()?,
    };
    let summary = service
        .connect_exchange(&args.target.user, args.target.exchange, &args.api_key, &secret)
        .await?;
    println!(
        "Connected {} for {} with permissions: {}",
        summary.exchange,
        summary.user_id,
        describe_permissions(&summary)
    );
    Ok(())
}

async fn handle_disconnect(
    service: &ExchangeSyncService,
    args: ExchangeArgs,
) -> anyhow::Result<()> {
    if service.disconnect_exchange(&args.user, args.exchange).await? {
        println!("Disconnected {} for {}.", args.exchange, args.user);
    } else {
        println!("No {} credential was connected for {}.", args.exchange, args.user);
    }
    Ok(())
}

async fn handle_list(service: &ExchangeSyncService, args: UserArgs) -> anyhow::Result<()> {
    let connections = service.list_connections(&args.user).await?;
    if connections.is_empty() {
        println!("No exchanges connected for {}.", args.user);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Exchange", "Status", "Permissions", "Last Sync", "Last Error"]);
    for connection in &connections {
        table.add_row(vec![
            connection.exchange.to_string(),
            connection.status.to_string(),
            describe_permissions(connection),
            connection
                .last_sync_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
            connection.last_error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_balances(
    service: &ExchangeSyncService,
    args: OutputExchangeArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let target = &args.target;
    let result = with_spinner(
        format!("Syncing {} balances", target.exchange),
        service.sync_balances(&target.user, target.exchange, cancel),
    )
    .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_balances(&result);
    }
    Ok(())
}

async fn handle_transactions(
    service: &ExchangeSyncService,
    args: TransactionArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let filter = args.filter()?;
    let target = &args.output.target;
    let result = with_spinner(
        format!("Syncing {} history", target.exchange),
        service.sync_transactions(&target.user, target.exchange, &filter, cancel),
    )
    .await?;

    if args.output.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_transactions(&result);
    }
    Ok(())
}

async fn handle_sync_all(
    service: &ExchangeSyncService,
    args: OutputUserArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let results = with_spinner(
        "Syncing every connected exchange".to_string(),
        service.sync_all(&args.user.user, cancel),
    )
    .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No exchanges connected for {}.", args.user.user);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Exchange", "Status", "Assets", "Value (USD)", "Errors"]);
    let mut total = Decimal::ZERO;
    for result in &results {
        total = total.saturating_add(result.total_value_usd);
        table.add_row(vec![
            result.exchange.to_string(),
            result.status.to_string(),
            result.balances.len().to_string(),
            result.total_value_usd.round_dp(2).to_string(),
            result.error_messages().join("; "),
        ]);
    }
    table.add_row(vec![
        "TOTAL".to_string(),
        String::new(),
        String::new(),
        total.round_dp(2).to_string(),
        String::new(),
    ]);
    println!("{table}");
    Ok(())
}

// ==============================================================================
// Output
// ==============================================================================

/// Runs `work` inside a span that renders as a spinner on stderr.
async fn with_spinner<T>(message: String, work: impl Future<Output = T>) -> T {
    let span = tracing::info_span!("sync");
    let template = "{spinner:.green} [{elapsed_precise}] {msg}";
    if let Ok(style) = ProgressStyle::default_spinner().template(template) {
        span.pb_set_style(&style);
    }
    span.pb_set_message(&message);
    work.instrument(span).await
}

fn describe_permissions(summary: &CredentialSummary) -> String {
    summary
        .permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_errors(status: impl std::fmt::Display, errors: &[core_types::SyncItemError]) {
    println!("Status: {status}");
    for error in errors {
        println!("  ! {error}");
    }
}

fn print_balances(result: &BalanceSyncResult) {
    print_errors(result.status, &result.errors);
    if result.balances.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["Asset", "Free", "Locked", "Total", "Price (USD)", "Value (USD)"]);
    for balance in &result.balances {
        table.add_row(vec![
            balance.asset.clone(),
            balance.free.normalize().to_string(),
            balance.locked.normalize().to_string(),
            balance.total.normalize().to_string(),
            balance.price_usd.normalize().to_string(),
            balance.value_usd.round_dp(2).to_string(),
        ]);
    }
    println!("{table}");
    println!("Total: {} USD", result.total_value_usd.round_dp(2));
    if !result.unpriced_assets.is_empty() {
        println!("No USD price for: {}", result.unpriced_assets.join(", "));
    }
    println!("Synced at {}", result.synced_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

fn print_transactions(result: &TransactionSyncResult) {
    print_errors(result.status, &result.errors);
    if result.transactions.is_empty() {
        println!("No transactions.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["Time", "Type", "Asset", "Amount", "Price", "Fee", "ID"]);
    for tx in &result.transactions {
        table.add_row(vec![
            tx.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            tx.tx_type.to_string(),
            tx.asset.clone(),
            tx.amount.normalize().to_string(),
            tx.price.map(|p| p.normalize().to_string()).unwrap_or_default(),
            match (&tx.fee, &tx.fee_asset) {
                (Some(fee), Some(asset)) => format!("{} {asset}", fee.normalize()),
                (Some(fee), None) => fee.normalize().to_string(),
                _ => String::new(),
            },
            tx.id.clone(),
        ]);
    }
    println!("{table}");
    println!("{} transactions", result.transactions.len());
}

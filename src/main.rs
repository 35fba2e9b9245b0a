// Produce Ledger - command line entry point
// `ui` (default) opens the terminal interface; the other subcommands are
// the same operations for scripts.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use produce_ledger::config::{AppConfig, DEFAULT_CONFIG_FILE};
use produce_ledger::db::{
    backup_database, bulk_insert_records, fetch_matching_records, get_daily_summary, setup_database,
    RecordQuery,
};
use produce_ledger::exporter::export_settlement;
use produce_ledger::importer::{import_file, parse_sheet_date};
use produce_ledger::logging::init_logging;
use produce_ledger::records::{PurchaseRecord, RecordKind, ShipmentRecord};
use produce_ledger::users::{add_user, get_user, list_users, remove_user, Role};
use produce_ledger::ManagedRecord;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "produce-ledger")]
#[command(about = "Grower purchases and client shipments, settled", version)]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, env = "PRODUCE_LEDGER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open the terminal interface (default)
    Ui,
    /// Import a CSV sheet; without --confirm only the preview is shown
    Import {
        /// purchase | shipment
        kind: RecordKind,
        file: PathBuf,
        #[arg(long)]
        confirm: bool,
    },
    /// Write a settlement sheet for one name
    Export {
        kind: RecordKind,
        #[arg(long)]
        name: String,
        #[arg(long, value_parser = parse_date_arg)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date_arg)]
        end: Option<NaiveDate>,
    },
    /// Print per-day totals
    Summary {
        kind: RecordKind,
        #[arg(long, value_parser = parse_date_arg)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date_arg)]
        end: Option<NaiveDate>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Manage login accounts
    #[command(subcommand)]
    User(UserCommand),
    /// Copy the database into backup_dir with a timestamped name
    Backup,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Add an account
    Add {
        username: String,
        #[arg(long, env = "PRODUCE_LEDGER_PASSWORD")]
        password: String,
        /// admin | user
        #[arg(long, default_value = "user")]
        role: Role,
    },
    /// List accounts
    List,
    /// Delete an account (the last admin is kept)
    Delete { username: String },
}

fn parse_date_arg(raw: &str) -> std::result::Result<NaiveDate, String> {
    parse_sheet_date(raw).map_err(|e| e.to_string())
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn).context("Failed to set up database schema")?;
    Ok(conn)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, origin) = AppConfig::load_or_init(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let interactive = matches!(cli.command, None | Some(Command::Ui));
    init_logging(&config.log_dir, !interactive)?;
    origin.log(&cli.config);

    let conn = open_database(&config.database_path)?;

    match cli.command.unwrap_or(Command::Ui) {
        Command::Ui => run_ui_mode(conn, config, cli.config),
        Command::Import { kind, file, confirm } => match kind {
            RecordKind::Purchase => run_import::<PurchaseRecord>(&conn, &file, confirm),
            RecordKind::Shipment => run_import::<ShipmentRecord>(&conn, &file, confirm),
        },
        Command::Export { kind, name, start, end } => {
            let query = RecordQuery::for_entity(&name, start, end);
            match kind {
                RecordKind::Purchase => run_export::<PurchaseRecord>(&conn, &query, &config),
                RecordKind::Shipment => run_export::<ShipmentRecord>(&conn, &query, &config),
            }
        }
        Command::Summary { kind, start, end, name } => run_summary(&conn, kind, start, end, name.as_deref()),
        Command::User(command) => run_user(&conn, command),
        Command::Backup => {
            let path = backup_database(
                &conn,
                &config.database_path,
                &config.backup_dir,
                Local::now().naive_local(),
            )?;
            println!("✅ Backup written to {}", path.display());
            Ok(())
        }
    }
}

fn run_user(conn: &Connection, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add { username, password, role } => {
            let user = add_user(conn, &username, &password, role)?;
            println!("✅ Added {} ({})", user.username, user.role.label());
        }
        UserCommand::List => {
            println!("{:<6} {:<20} {}", "id", "username", "role");
            for user in list_users(conn)? {
                println!("{:<6} {:<20} {}", user.id, user.username, user.role);
            }
        }
        UserCommand::Delete { username } => {
            let Some(user) = get_user(conn, &username)? else {
                bail!("No user named '{}'", username.trim());
            };
            remove_user(conn, user.id)?;
            println!("✅ Deleted {}", user.username);
        }
    }
    Ok(())
}

fn run_import<R: ManagedRecord>(conn: &Connection, file: &Path, confirm: bool) -> Result<()> {
    println!("📥 Importing {} records from {}", R::KIND.label(), file.display());

    let outcome = import_file::<R, _>(file, conn)?;
    for skipped in &outcome.skipped {
        println!("   ⚠️  line {}: {}", skipped.line, skipped.reason);
    }
    println!("✓ {}", outcome.summary());

    if outcome.new_records.is_empty() {
        return Ok(());
    }
    if !confirm {
        println!("   Run again with --confirm to store the new records.");
        return Ok(());
    }

    let inserted = bulk_insert_records(conn, &outcome.new_records)?;
    println!("✅ Stored {} records", inserted);
    Ok(())
}

fn run_export<R: ManagedRecord>(conn: &Connection, query: &RecordQuery, config: &AppConfig) -> Result<()> {
    let records = fetch_matching_records::<R>(conn, query)?;
    if records.is_empty() {
        bail!("No {} records match the given name and dates", R::KIND.label());
    }
    let path = export_settlement(&records, config)?;
    println!("✅ Settlement written to {}", path.display());
    Ok(())
}

fn run_summary(
    conn: &Connection,
    kind: RecordKind,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    name: Option<&str>,
) -> Result<()> {
    let end = end.unwrap_or_else(|| Local::now().date_naive());
    let start = start.unwrap_or(end - Duration::days(30));
    let rows = get_daily_summary(conn, kind, start, end, name)?;

    println!("📊 {} {} → {}", kind.label(), start, end);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{:<12} {:>6} {:>14} {:>14}", "date", "count", "weight", "amount");
    let (mut amount, mut weight, mut count) = (0.0, 0.0, 0);
    for row in &rows {
        println!(
            "{:<12} {:>6} {:>14.2} {:>14.2}",
            row.date.to_string(),
            row.record_count,
            row.total_weight,
            row.total_amount
        );
        amount += row.total_amount;
        weight += row.total_weight;
        count += row.record_count;
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{:<12} {:>6} {:>14.2} {:>14.2}", "total", count, weight, amount);
    Ok(())
}

#[cfg(feature = "tui")]
fn run_ui_mode(conn: Connection, config: AppConfig, config_path: PathBuf) -> Result<()> {
    let db_path = config.database_path.clone();
    let mut app = produce_ledger::ui::App::new(conn, db_path, config)?.with_config_path(config_path);
    produce_ledger::ui::run_ui(&mut app)?;
    println!("✅ UI closed");
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_conn: Connection, _config: AppConfig, _config_path: PathBuf) -> Result<()> {
    eprintln!("❌ TUI mode not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use the web API: cargo run --bin ledger-server --features server");
    std::process::exit(1);
}

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;

use tombola::config::Config;
use tombola::downloader;
use tombola::error::{Result, TombolaError};
use tombola::loader::{ImportOptions, read_orders_from_path};
use tombola::store::OrderStore;
use tombola::tickets::{expand, ticket_ranges, total_tickets};

#[derive(Parser)]
#[command(author, version, about = "Raffle ticket office without the web interface")]
struct Cli {
    /// Database URL; defaults to DATABASE_URL / DB_NAME from the environment
    #[arg(short, long, global = true)]
    database: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the orders table
    InitDb,
    /// Import a Jimdo order export
    Import {
        file: PathBuf,
        /// Drop orders placed before this day (YYYY-MM-DD)
        #[arg(long)]
        min_date: Option<NaiveDate>,
        /// Import every order placed, whatever the date
        #[arg(long, conflicts_with = "min_date")]
        all_dates: bool,
        /// Shop article whose rows are tickets
        #[arg(long)]
        article: Option<String>,
    },
    /// Write one row per ticket; the format follows the extension (.xlsx or .csv)
    Export { file: PathBuf },
    /// Print every order with its ticket numbers
    List,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    let database_url = cli.database.unwrap_or(config.database_url);
    let store = OrderStore::connect(&database_url).await?;
    store.migrate().await?;

    match cli.command {
        Commands::InitDb => {
            println!("Database ready at {}", database_url);
        }
        Commands::Import {
            file,
            min_date,
            all_dates,
            article,
        } => {
            let options = ImportOptions {
                article: Some(article.unwrap_or(config.article)),
                min_date: if all_dates { None } else { min_date.or(config.min_date) },
                ..ImportOptions::default()
            };
            info!("Importing {}", file.display());
            let orders = read_orders_from_path(&file, &options)?;
            let summary = store.upsert_all(orders).await?;
            println!(
                "Imported {} order(s): {} new, {} updated",
                summary.total(),
                summary.inserted,
                summary.updated
            );
        }
        Commands::Export { file } => {
            let orders = store.list_all().await?;
            write_export(&file, &orders)?;
            println!(
                "Wrote {} ticket(s) to {}",
                total_tickets(&orders),
                file.display()
            );
        }
        Commands::List => {
            let orders = store.list_all().await?;
            for (order, range) in ticket_ranges(&orders) {
                let numbers = match range {
                    Some(range) => format!("{}..={}", range.start(), range.end()),
                    None => "-".to_string(),
                };
                println!(
                    "{}  {:<30} {:>3}  {:<12} {}{}",
                    order.date,
                    order.name,
                    order.num_tickets,
                    numbers,
                    order.email,
                    if order.is_notified() { "  (sent)" } else { "" }
                );
            }
            println!(
                "{} order(s), {} ticket(s)",
                orders.len(),
                total_tickets(&orders)
            );
        }
    }

    store.close().await;
    Ok(())
}

fn write_export(path: &Path, orders: &[tombola::order::Order]) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let bytes = match extension.as_deref() {
        Some("xlsx") => downloader::to_xlsx(expand(orders))?,
        Some("csv") => downloader::to_csv(expand(orders))?.into_bytes(),
        _ => {
            return Err(TombolaError::Export(format!(
                "unsupported export format: {} (use .xlsx or .csv)",
                path.display()
            )));
        }
    };
    std::fs::write(path, bytes).map_err(|e| TombolaError::Export(e.to_string()))
}

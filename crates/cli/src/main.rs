//! Tally CLI - drive the progress engine from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CalendarDay, CatalogItem, ItemId, ItemKind};
use tally_progress::{EngineConfig, EngineDeps, ProgressEngine, ReconcileOutcome, ReloadPolicy};
use tally_storage::{ItemCatalog, JsonStorage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Track daily counts and timed progress", long_about = None)]
struct Cli {
    /// Storage directory
    #[arg(long, global = true, env = "TALLY_DIR", default_value = ".tally")]
    dir: PathBuf,

    /// How time accrued while the process was not running is treated
    /// (carry-gap or restart-clock)
    #[arg(long, global = true, env = "TALLY_RELOAD_POLICY", default_value = "carry-gap")]
    reload_policy: ReloadPolicy,

    /// Starting a timer stops every other running timer
    #[arg(long, global = true)]
    single_active: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tracked items
    Item {
        #[command(subcommand)]
        command: ItemCommands,
    },
    /// Add to (or subtract from) an item's amount
    Add {
        /// Item ID
        id: String,
        /// Signed delta
        #[arg(allow_negative_numbers = true)]
        delta: i64,
    },
    /// Start a timer
    Start {
        /// Item ID
        id: String,
        /// Amount to start from if the item has no progress yet
        #[arg(long, default_value = "0")]
        initial: u64,
    },
    /// Stop a timer
    Stop {
        /// Item ID
        id: String,
    },
    /// Reset an item's amount to zero
    Reset {
        /// Item ID
        id: String,
    },
    /// Show current amounts
    Show {
        /// Item ID (all items if omitted)
        id: Option<String>,
    },
    /// Record current amounts in the daily history
    Persist {
        /// Day to record (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        day: Option<CalendarDay>,
    },
    /// Show recorded history of an item
    History {
        /// Item ID
        id: String,
    },
    /// Follow live updates until interrupted
    Watch,
}

#[derive(Subcommand)]
enum ItemCommands {
    /// Register a new item
    Add {
        /// Display name
        name: String,
        /// counter or timer
        #[arg(long, default_value = "counter")]
        kind: ItemKind,
    },
    /// List registered items
    List,
    /// Remove an item and its progress
    Remove {
        /// Item ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let storage = Arc::new(
        JsonStorage::new(&cli.dir)
            .await
            .with_context(|| format!("opening storage at {}", cli.dir.display()))?,
    );
    let config = EngineConfig::default()
        .with_reload_policy(cli.reload_policy)
        .with_single_active_accrual(cli.single_active);
    let engine = ProgressEngine::open(config, EngineDeps::from_backend(storage.clone())).await;

    let result = run(cli.command, &engine, &storage).await;

    engine.shutdown().await;
    result
}

async fn run(command: Commands, engine: &ProgressEngine, storage: &JsonStorage) -> Result<()> {
    match command {
        Commands::Item { command } => run_item(command, engine, storage).await?,
        Commands::Add { id, delta } => {
            let item = known_item(storage, &id).await?;
            let amount = engine.add_amount(&item.id, delta).await;
            println!("{}: {}", item.name, format_amount(item.kind, amount));
        }
        Commands::Start { id, initial } => {
            let item = known_item(storage, &id).await?;
            if !item.kind.accrues() {
                bail!("{} is a counter; only timers can be started", item.name);
            }
            engine.start_accrual(&item.id, initial).await;
            println!("Started {}", item.name);
        }
        Commands::Stop { id } => {
            let item = known_item(storage, &id).await?;
            engine.stop_accrual(&item.id).await;
            let amount = engine.current_amount(&item.id).await;
            println!("Stopped {} at {}", item.name, format_amount(item.kind, amount));
        }
        Commands::Reset { id } => {
            let item = known_item(storage, &id).await?;
            engine.reset_amount(&item.id).await;
            println!("Reset {}", item.name);
        }
        Commands::Show { id } => {
            let items = match id {
                Some(id) => vec![known_item(storage, &id).await?],
                None => storage.list_items().await?,
            };
            let view = engine.view().await;

            println!("Progress ({})", items.len());
            for item in items {
                let progress = view.get(&item.id).copied().unwrap_or_default();
                println!(
                    "  {} | {} | {}{}",
                    item.id,
                    item.name,
                    format_amount(item.kind, progress.amount),
                    if progress.is_accruing { " (running)" } else { "" },
                );
            }
        }
        Commands::Persist { day } => {
            let report = engine.persist_all(day).await;
            println!(
                "Recorded {} items ({} unchanged, {} skipped)",
                report.written.len(),
                report.unchanged.len(),
                report.skipped.len()
            );
            for (id, error) in &report.failures {
                warn!("{}: {}", id, error);
            }
            if !report.is_clean() {
                bail!("{} items could not be recorded", report.failures.len());
            }
        }
        Commands::History { id } => {
            let item = known_item(storage, &id).await?;
            let entries = engine.history(&item.id).await?;

            println!("History of {} ({})", item.name, entries.len());
            for entry in entries {
                println!("  {} | {}", entry.day, format_amount(item.kind, entry.amount));
            }
        }
        Commands::Watch => watch(engine).await?,
    }

    Ok(())
}

async fn run_item(command: ItemCommands, engine: &ProgressEngine, storage: &JsonStorage) -> Result<()> {
    match command {
        ItemCommands::Add { name, kind } => {
            let item = CatalogItem::new(name, kind);
            storage.register_item(&item).await?;
            println!("Added {}: {} - {}", item.kind, item.id, item.name);
        }
        ItemCommands::List => {
            let items = storage.list_items().await?;
            println!("Items ({})", items.len());
            for item in items {
                println!("  {} | {} | {}", item.id, item.kind, item.name);
            }
        }
        ItemCommands::Remove { id } => {
            let item = known_item(storage, &id).await?;
            // Close out today before the catalog entry disappears.
            match engine.persist_one(&item.id, None).await {
                Ok(ReconcileOutcome::Written(amount)) => info!("Recorded {} for {}", amount, item.id),
                Ok(_) => {}
                Err(e) => warn!("{}", e),
            }
            engine.forget_item(&item.id).await;
            storage.remove_item(&item.id).await?;
            println!("Removed {}", item.name);
        }
    }
    Ok(())
}

async fn watch(engine: &ProgressEngine) -> Result<()> {
    let mut subscription = engine.subscribe();
    println!("Watching for updates, press Ctrl-C to stop");

    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(update) = update else { break };
                let line: Vec<String> = update
                    .items
                    .iter()
                    .map(|(id, p)| format!("{}={}{}", id, p.amount, if p.is_accruing { "*" } else { "" }))
                    .collect();
                println!("[{}] {}", update.emitted_at.format("%H:%M:%S"), line.join(" "));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscription.cancel();
    // Give the background flush a moment before shutdown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

async fn known_item(storage: &JsonStorage, id: &str) -> Result<CatalogItem> {
    let id: ItemId = id.parse().context("invalid item ID")?;
    match storage.load_item(&id).await? {
        Some(item) => Ok(item),
        None => bail!("item not found: {}", id),
    }
}

fn format_amount(kind: ItemKind, amount: u64) -> String {
    match kind {
        ItemKind::Counter => amount.to_string(),
        ItemKind::Timer => format!("{:02}:{:02}:{:02}", amount / 3600, amount % 3600 / 60, amount % 60),
    }
}

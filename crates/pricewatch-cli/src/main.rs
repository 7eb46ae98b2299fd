use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_core::TrackedItem;
use pricewatch_storage::Store;
use pricewatch_sync::{build_scheduler, ItemCheckOutcome, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Price-watch sweeps, tracking and rate-limit administration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sweep over every active item.
    Sweep,
    /// Sweep periodically at the stored check interval until ctrl-c.
    /// Requires PRICEWATCH_SCHEDULER_ENABLED.
    Watch,
    /// Start tracking a product page.
    Track {
        url: String,
        /// CSS selector for the price on sites without an adapter.
        #[arg(long)]
        selector: Option<String>,
    },
    /// Check one tracked item now.
    Check { id: Uuid },
    /// Show the support tier a URL resolves to.
    Classify { url: String },
    /// List domains currently backing off.
    Limits,
    /// Reset backoff for a domain.
    ClearLimit { domain: String },
    /// List tracked items.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let scheduler = Arc::new(build_scheduler(&config).context("building sweep runtime")?);
    let orchestrator = scheduler.orchestrator();

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Sweep => {
            let summary = scheduler.trigger_now().await?;
            println!(
                "sweep complete: run_id={} checked={} succeeded={} failed={} skipped={} duration_ms={}",
                summary.run_id,
                summary.checked,
                summary.succeeded,
                summary.failed,
                summary.skipped,
                summary.duration_ms
            );
        }
        Commands::Watch => {
            let Some(mut sched) = scheduler.clone().maybe_start(&config).await? else {
                bail!("periodic sweeps are disabled; set PRICEWATCH_SCHEDULER_ENABLED=1");
            };
            tracing::info!("watching; ctrl-c to stop");
            if let Err(err) = scheduler.trigger_now().await {
                tracing::warn!(error = %err, "initial sweep failed");
            }
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Track { url, selector } => {
            let item = scheduler.track_item(&url, selector.as_deref()).await?;
            println!("tracking {}", describe(&item));
        }
        Commands::Check { id } => match scheduler.check_item(id).await? {
            ItemCheckOutcome::Updated { drop: Some(drop), .. } => println!(
                "price dropped {:.1}%: {:.2} -> {:.2}",
                drop.percent_drop, drop.old_price, drop.new_price
            ),
            ItemCheckOutcome::Updated { price_changed, .. } => {
                println!("checked; price changed: {price_changed}")
            }
            ItemCheckOutcome::Skipped { minutes_until_retry } => {
                println!("domain backing off; retry in {minutes_until_retry} min")
            }
            ItemCheckOutcome::Failed { reason } => println!("check failed: {reason}"),
        },
        Commands::Classify { url } => {
            let classification = orchestrator.resolver().classify(&url);
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        Commands::Limits => {
            let limiter = orchestrator.list_limits().await;
            if limiter.is_empty() {
                println!("no domains are backing off");
            }
            for bucket in limiter.buckets() {
                println!(
                    "{} failures={} level={} retry_in_min={} reason={}",
                    bucket.domain,
                    bucket.failure_count,
                    bucket.backoff_level,
                    limiter.minutes_until_retry(&bucket.domain),
                    bucket.last_failure_reason.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::ClearLimit { domain } => {
            if orchestrator.clear_limit(&domain).await? {
                println!("cleared backoff for {domain}");
            } else {
                println!("{domain} had no backoff");
            }
        }
        Commands::List => {
            for item in orchestrator.list_items().await? {
                println!("{}", describe(&item));
            }
            match orchestrator.store().last_sweep_at().await? {
                Some(at) => println!("last sweep: {at}"),
                None => println!("no sweep has completed yet"),
            }
        }
    }

    Ok(())
}

fn describe(item: &TrackedItem) -> String {
    format!(
        "{} [{}{}] {:.2} {} {} {}",
        item.id,
        item.tier_at_creation,
        if item.is_active { "" } else { ", paused" },
        item.current_price,
        item.currency,
        item.title,
        item.url
    )
}

//! Reap command - destroy expired sessions.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use console::Style;
use hearth_session::{ScavengeReport, SessionManager, StoreConfig};

use super::Context;

/// Arguments for the reap command.
#[derive(Args, Debug)]
pub struct ReapArgs {
    /// Keep reaping until interrupted
    #[arg(short, long)]
    pub watch: bool,

    /// Seconds between passes with --watch (default: scavenge_interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,
}

/// Run the reap command.
pub async fn run(args: ReapArgs, ctx: &Context) -> Result<()> {
    let interval = args
        .interval
        .unwrap_or(ctx.config.scavenge_interval_secs)
        .max(1);

    // Passes are driven from here, not by the background loop.
    let mut config = ctx.config.clone();
    config.scavenge_interval_secs = 0;
    let manager = SessionManager::initialize(config).await?;
    if !scans_store(&ctx.config.store) && !ctx.json_output {
        let dim = Style::new().dim();
        eprintln!(
            "{}",
            dim.apply_to(format!(
                "{} store is not scanned; its keys expire by TTL",
                manager.cache().store().name()
            ))
        );
    }

    let report = manager.scavenge_now().await;
    print_report(&report, ctx);

    if args.watch {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    let report = manager.scavenge_now().await;
                    print_report(&report, ctx);
                }
            }
        }
    }

    manager.destroy().await;
    Ok(())
}

/// Only the file store can list every stored session.
fn scans_store(store: &StoreConfig) -> bool {
    matches!(store, StoreConfig::File(_))
}

fn print_report(report: &ScavengeReport, ctx: &Context) {
    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({
                "candidates": report.candidates,
                "invalidated": report.invalidated,
                "evicted": report.evicted,
                "failures": report.failures,
                "store_scanned": scans_store(&ctx.config.store),
            })
        );
    } else if report.has_failures() {
        let yellow = Style::new().yellow();
        println!("{}", yellow.apply_to(report));
    } else {
        println!("{report}");
    }
}

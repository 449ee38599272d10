//! Inspect command - print a stored session snapshot.

use anyhow::{Result, bail};
use clap::Args;
use console::Style;
use hearth_session::{now_millis, open_store};

use super::Context;

/// Arguments for the inspect command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Session id
    pub id: String,
}

/// Run the inspect command.
pub async fn run(args: InspectArgs, ctx: &Context) -> Result<()> {
    let store = open_store(&ctx.config.store).await?;
    let snapshot = store.load(&args.id).await;
    store.close().await;

    let Some(snapshot) = snapshot? else {
        bail!("session {} not found in {} store", args.id, store.name());
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let bold = Style::new().bold();
    println!("{} {}", bold.apply_to("Session"), snapshot.id);
    println!("  {} {}", dim.apply_to("created:      "), format_millis(snapshot.created_at));
    println!("  {} {}", dim.apply_to("last accessed:"), format_millis(snapshot.last_accessed));
    match snapshot.expiry() {
        Some(expiry) if snapshot.is_expired(now_millis()) => {
            let red = Style::new().red();
            println!("  {} {} {}", dim.apply_to("expires:      "), format_millis(expiry), red.apply_to("(expired)"));
        }
        Some(expiry) => println!("  {} {}", dim.apply_to("expires:      "), format_millis(expiry)),
        None => println!("  {} never", dim.apply_to("expires:      ")),
    }

    let mut names: Vec<_> = snapshot.attributes.keys().collect();
    names.sort();
    println!("  {} {}", dim.apply_to("attributes:   "), names.len());
    for name in names {
        println!("    {} = {}", name, snapshot.attributes[name]);
    }
    if ctx.verbose {
        println!("  {} {}s", dim.apply_to("max inactive: "), snapshot.max_inactive_secs);
    }
    Ok(())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| millis.to_string())
}

//! Delete command - remove a stored session snapshot.

use anyhow::Result;
use clap::Args;
use console::Style;
use hearth_session::open_store;

use super::Context;

/// Arguments for the delete command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Session id
    pub id: String,
}

/// Run the delete command.
///
/// Works on the store directly, so no destroy listeners fire.
pub async fn run(args: DeleteArgs, ctx: &Context) -> Result<()> {
    let store = open_store(&ctx.config.store).await?;
    let deleted = store.delete(&args.id).await;
    store.close().await;
    let deleted = deleted?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "id": args.id, "deleted": deleted }));
    } else if deleted {
        println!("Deleted session {}", args.id);
    } else {
        let dim = Style::new().dim();
        println!("{}", dim.apply_to(format!("No session {} in {} store", args.id, store.name())));
    }
    Ok(())
}

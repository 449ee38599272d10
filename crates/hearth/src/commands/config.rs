//! Config command - print the effective configuration.

use anyhow::Result;
use clap::Args;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print the default config file path instead
    #[arg(long)]
    pub path: bool,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    if args.path {
        match super::default_config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no config directory on this platform"),
        }
        return Ok(());
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&ctx.config)?);
    } else {
        print!("{}", ctx.config.to_toml()?);
    }
    Ok(())
}

use clap::Parser;
use tracing::info;

use macroflow::cli::{self, Cli, Commands};
use macroflow::config::Settings;
use macroflow::types::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Settings are optional for every command; a missing file falls back
    // to defaults so the tool works out of a bare checkout.
    let settings = Settings::load_from_file(&cli.config).ok();

    let log_level_override = if cli.log_level.is_some() || cli.verbose || cli.quiet {
        Some(cli.log_level_to_str())
    } else {
        None
    };

    macroflow::logging::init(
        log_level_override,
        cli.log_format_override(),
        settings.as_ref(),
    )?;

    let settings = settings.unwrap_or_default();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting macroflow");

    match cli.command.clone() {
        Commands::Validate => cli::validate_macros(cli, settings).await,
        Commands::List => cli::list_macros(cli, settings).await,
        Commands::Run(args) => cli::run_macro(cli, args, settings).await,
        Commands::Serve(args) => cli::serve(cli, args, settings).await,
    }
}

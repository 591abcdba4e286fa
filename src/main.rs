use anyhow::{Context, Result};
use log::{info, warn};

use rs485_poller::cli::{build_cli, handle_subcommands};
use rs485_poller::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    // global options are propagated to the selected subcommand
    let active = matches.subcommand().map(|(_, sub)| sub).unwrap_or(&matches);

    let default_filter = if active.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if matches.subcommand_name() == Some("init-config") {
        return handle_subcommands(&matches, Config::default()).await;
    }

    let mut config = match active.get_one::<String>("config") {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Cannot load configuration {}", path))?,
        None => {
            warn!("⚠️  No --config given, using built-in defaults");
            Config::default()
        }
    };
    config.apply_matches(active)?;

    info!("🖥️  rs485_poller v{} ({})", rs485_poller::VERSION, config.edge_name);
    handle_subcommands(&matches, config).await
}

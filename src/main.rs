use anyhow::{Context, Result};
use log::info;

use esp_telemetry::cli::{build_cli, handle_subcommands};
use esp_telemetry::Config;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    config.apply_matches(&matches)?;

    info!("🚀 esp-telemetry {}", esp_telemetry::VERSION);
    if !handle_subcommands(&matches, config).await? {
        build_cli().print_help()?;
        println!();
    }
    Ok(())
}

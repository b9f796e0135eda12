use clap::{Arg, ArgAction, Command};
use pool_core::logging::init_logging;
use pool_core::PoolConfig;
use std::path::PathBuf;
use tracing::{error, info};

mod block_notify;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("poold")
        .version("0.1.0")
        .about("Stratum mining pool daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .value_parser(clap::value_parser!(PathBuf))
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue)
        )
        .get_matches();

    let config_path = matches.get_one::<PathBuf>("config");

    // Environment overrides and validation happen inside load_with_env
    let config = PoolConfig::load_with_env(config_path.map(PathBuf::as_path))?;

    if matches.get_flag("check") {
        println!("Configuration for pool '{}' is valid", config.name);
        return Ok(());
    }

    init_logging(&config.logging)?;

    match config_path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("Using default configuration"),
    }
    info!("Starting pool {} on stratum port {}", config.name, config.stratum_port);

    if let Err(e) = service::run(config).await {
        error!("Pool daemon error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

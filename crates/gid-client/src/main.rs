//! gid-client entry point

use clap::Parser;
use gid_client::{Cli, CliOverrides, Config, ExitCode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    // Only the default location is created on first run
    if cli.config.is_none() {
        if let Err(e) = Config::create_default_if_missing() {
            eprintln!("Warning: Could not create default config: {e}");
        }
    }

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Config error: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    let overrides = CliOverrides {
        server: cli.server.clone(),
        verbose: if cli.verbose { Some(true) } else { None },
        debug: if cli.debug { Some(true) } else { None },
    };

    let config = match config.with_overrides(&overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::InvalidInput.to_exit_code();
        }
    };

    // --verbose/--debug, then RUST_LOG, then the configured level
    let configured =
        || EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let filter = if cli.debug || cli.verbose {
        configured()
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| configured())
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::GeneralError.to_exit_code()
        }
    }
}

mod config;
mod error;

use std::sync::Mutex;

use clap::Parser;
use config::{Cli, Commands, LogArgs};
use error::ServerError;
use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod cmd;

/// RUST_LOG важнее LOG_LEVEL. LOG_FILE_PATH добавляет второй слой без ANSI.
fn init_logging(args: &LogArgs) -> Result<(), ServerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ServerError::config("log file", format!("'{}': {e}", path.display())))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.logging) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let span = tracing::info_span!("service", name = %cli.logging.service_name);
    let result = match cli.command {
        Commands::Serve(args) => cmd::serve::run(args).instrument(span).await,
        Commands::Publish(args) => cmd::publish::run(args).instrument(span).await,
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "fatal");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

//! fhirpipe CLI entrypoint

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fhirpipe::cli::Cli;
use fhirpipe::error::{PipelineError, EXIT_INTERNAL};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so stdout stays for tables
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Ctrl-C cancels the running step; its state is saved for `pipeline continue`
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });

    match cli.execute(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<PipelineError>() {
            Some(classified) => {
                eprintln!("\n{}", classified.user_report());
                ExitCode::from(classified.exit_code() as u8)
            }
            None => {
                eprintln!("\nError: {:#}", err);
                ExitCode::from(EXIT_INTERNAL as u8)
            }
        },
    }
}

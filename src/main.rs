use std::process::ExitCode;

use clap::Parser;

use conveyor::app::App;
use conveyor::cli::Args;
use conveyor::config::Config;
use conveyor::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(node) = args.node {
        config.node = node;
    }

    setup_logging(&config, args.tracing);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting conveyor"
    );

    let mut app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = ?e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    app.setup_services();
    app.start_services();
    app.run().await
}

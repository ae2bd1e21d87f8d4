use std::process;

use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use papersift_app::services::BuildError;
use papersift_app::{config, paths, worker};
use papersift_server::cli::{Cli, Commands};
use papersift_server::server;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] paths::PathError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(args)) => {
            let config = config::load()?;
            let app_paths = paths::AppPaths::from_project_dirs()?;
            let services = papersift_app::build_services(config, &app_paths)?;
            server::serve(services, !args.no_worker).await?;
        }
        Some(Commands::Worker(_)) => {
            let config = config::load()?;
            let app_paths = paths::AppPaths::from_project_dirs()?;
            let services = papersift_app::build_services(config, &app_paths)?;
            run_worker(services).await;
        }
        None => {
            Cli::print_help();
        }
    }
    Ok(())
}

async fn run_worker(services: std::sync::Arc<papersift_app::Services>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        server::wait_for_shutdown().await;
        let _ = stop_tx.send(true);
    });
    worker::run_pool(services, stop_rx).await;
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

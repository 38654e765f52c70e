mod cli;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Commands};
use spiderq::config::Config;
use spiderq::observability::init_tracing;
use spiderq::{api, master, worker};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Broker(args) => {
            if let Some(address) = args.address {
                config.broker.bind_addr = address;
            }
            match api::run(&config.broker).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "Broker failed");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Master(args) => match master::run(&config, args.partitions).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) if e.is_connection() => broker_unreachable(&e),
            Err(e) => {
                error!(error = %e, "Task distribution failed");
                ExitCode::FAILURE
            }
        },
        Commands::Worker => match worker::run(&config).await {
            Ok(_) => {
                info!("Worker stopped");
                ExitCode::SUCCESS
            }
            Err(e) if e.is_connection() => broker_unreachable(&e),
            Err(e) => {
                error!(error = %e, "Worker failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn broker_unreachable(e: &dyn std::error::Error) -> ExitCode {
    tracing::debug!(error = %e, "Broker connection error");
    error!(fatal = true, "Cannot connect to message broker, aborting");
    ExitCode::FAILURE
}

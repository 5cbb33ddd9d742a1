mod buffer;
mod cli;
mod error;
mod grid;
mod image;
mod metadata;
mod parquet;
mod reshuffle;
mod store;
mod update;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::{command, Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Reshuffle(args) => {
            let summary = command::reshuffle(args).await?;
            command::report(&summary, args.json)
        }
        Commands::Update(args) => {
            let summary = command::update(args).await?;
            command::report(&summary, args.json)
        }
        Commands::Read(args) => {
            command::read(args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

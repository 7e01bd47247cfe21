use anyhow::Context;
use clap::Parser;

use crate::{
    config::{config_path, load_config},
    infra::cli::{run, Cli},
};

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .format_target(false)
    .init();

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };
    let app_config = load_config(&path).with_context(|| format!("Can't load {}", path.display()))?;
    log::debug!("Loaded config from {}", path.display());
    run(cli, &path, app_config).await
}

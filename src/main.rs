use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::task::spawn_blocking;

use crate::opts::{Opts, Subcommand};
use crate::prelude::*;

mod bandit;
mod discretize;
mod error;
mod features;
mod helpers;
mod math;
mod opts;
mod prelude;
mod recommender;
mod scorer;
mod snapshot;
mod trainer;

#[tokio::main]
async fn main() -> Result {
    let opts = Opts::parse();
    let _sentry_guard = helpers::tracing::init(opts.sentry_dsn.clone(), opts.traces_sample_rate)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting…");

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(stop_on_ctrl_c(Arc::clone(&stop)));

    let result = run_subcommand(opts.subcommand, stop).await;
    if let Err(error) = &result {
        sentry::integrations::anyhow::capture_anyhow(error);
        error!("fatal error: {:#}", error);
    }
    result
}

async fn run_subcommand(subcommand: Subcommand, stop: Arc<AtomicBool>) -> Result {
    match subcommand {
        Subcommand::TrainScorer(opts) => {
            spawn_blocking(move || trainer::scorer::run(opts, &stop)).await?
        }
        Subcommand::TrainBandit(opts) => {
            spawn_blocking(move || trainer::bandit::run(opts, &stop)).await?
        }
        Subcommand::Recommend(opts) => spawn_blocking(move || recommender::run(opts)).await?,
        Subcommand::Discretize(opts) => discretize::run(opts),
    }
}

/// Asks the running trainer to save its snapshot and exit after the current batch.
async fn stop_on_ctrl_c(stop: Arc<AtomicBool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("interrupted, stopping after the current batch…");
            stop.store(true, Ordering::Relaxed);
        }
        Err(error) => error!("failed to listen for Ctrl+C: {:#}", error),
    }
}

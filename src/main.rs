use clap::Parser;
use tracing_subscriber::EnvFilter;

use train_lib::cli::Flags;
use train_lib::driver;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Flags::parse().into_config()?;
    tracing::debug!(?config, "configuration");
    let metrics = driver::run(&config)?;
    tracing::info!(
        train_loss = metrics.train_loss,
        train_accuracy = metrics.train_accuracy,
        test_loss = metrics.test_loss,
        test_accuracy = metrics.test_accuracy,
        "training finished"
    );
    Ok(())
}

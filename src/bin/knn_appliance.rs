use std::{error::Error, net::SocketAddr, path::PathBuf};

use clap::Parser;
use knnwire::{Metric, cli::load_vectors, protocol::MockAppliance};

#[derive(Debug, Parser)]
#[command(version, about = "Local stand-in for the k-NN search appliance")]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Dataset to search, one vector per line
    dataset: PathBuf,
    /// Distance metric, L2 or IP
    #[arg(long, default_value = "L2", value_parser = parse_metric)]
    metric: Metric,
    /// Only accept requests carrying this key
    #[arg(long, env = "KNN_API_KEY")]
    api_key: Option<String>,
    /// Maximum number of connections served at once
    #[arg(long, default_value_t = 16)]
    workers: usize,
}

fn parse_metric(s: &str) -> Result<Metric, String> {
    Metric::try_from(s).map_err(|e| e.to_string())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let dataset = load_vectors(&cli.dataset)?;

    let mut appliance = MockAppliance::new(dataset, cli.metric).with_workers(cli.workers);
    if let Some(key) = &cli.api_key {
        appliance = appliance.with_api_key(key);
    }

    appliance.listen(cli.address)?;
    Ok(())
}

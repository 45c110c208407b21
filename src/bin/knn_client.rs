use std::{error::Error, io, path::PathBuf};

use clap::{Parser, Subcommand};
use knnwire::{
    Client, Metric, Progress, QueryVectors, SessionPool,
    cli::{load_vectors, write_results},
    client::{DEFAULT_BATCH_SIZE, DEFAULT_FILE_BATCH_SIZE, DEFAULT_K},
    protocol::CancelHandle,
};
use log::warn;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Appliance host name or IP address
    #[arg(long, env = "KNN_HOST")]
    host: String,
    /// Appliance port
    #[arg(long, env = "KNN_PORT")]
    port: u16,
    /// User access key
    #[arg(long, env = "KNN_API_KEY", default_value = "")]
    api_key: String,

    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Load a dataset file that is already on the appliance's disk
    Load {
        /// Path to the dataset file on the appliance
        file: String,
        /// Dataset name inside an HDF5 file
        #[arg(long, default_value = "")]
        dataset: String,
        /// Distance metric, L2 or IP
        #[arg(long, default_value = "L2", value_parser = parse_metric)]
        metric: Metric,
    },
    /// Search for the nearest neighbours of vectors read from a local text file
    Query {
        /// One vector per line, whitespace or comma separated
        vectors: PathBuf,
        #[arg(short, default_value_t = DEFAULT_K)]
        k: u32,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Spread mini-batches over this many connections
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Report progress between mini-batches
        #[arg(long)]
        verbose: bool,
    },
    /// Search using query vectors stored in a file on the appliance
    QueryFile {
        /// Path to the query vectors file on the appliance
        file: String,
        #[arg(long, default_value = "")]
        dataset: String,
        #[arg(short, default_value_t = DEFAULT_K)]
        k: u32,
        #[arg(long, default_value_t = DEFAULT_FILE_BATCH_SIZE)]
        batch_size: usize,
    },
}

fn parse_metric(s: &str) -> Result<Metric, String> {
    Metric::try_from(s).map_err(|e| e.to_string())
}

/// Ctrl-C unblocks pending reads; their round trips then fail as closed connections.
fn cancel_on_ctrlc(handles: Vec<CancelHandle>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        for handle in &handles {
            if let Err(e) = handle.cancel() {
                warn!("failed to cancel request: {e}");
            }
        }
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    if let Action::Query {
        vectors,
        k,
        batch_size,
        workers,
        ..
    } = &cli.command
    {
        if *workers > 1 {
            let matrix = load_vectors(vectors)?;
            let pool = SessionPool::connect(&cli.host, cli.port, &cli.api_key, *workers)?;
            cancel_on_ctrlc(pool.cancel_handles()?)?;
            let result = pool.query(&matrix, *k, *batch_size)?;
            write_results(io::stdout().lock(), &result)?;
            eprintln!("{}", result.timings);
            return Ok(());
        }
    }

    let mut client = Client::connect(&cli.host, cli.port, &cli.api_key)?;

    cancel_on_ctrlc(vec![client.cancel_handle()?])?;

    match cli.command {
        Action::Load {
            file,
            dataset,
            metric,
        } => {
            client.load_dataset_file(&file, &dataset, metric)?;
            println!("Loaded '{file}'.");
        }
        Action::Query {
            vectors,
            k,
            batch_size,
            verbose,
            ..
        } => {
            let vectors = QueryVectors::Batch(load_vectors(&vectors)?);
            let result = if verbose {
                let mut report = |p: &Progress| eprintln!("  {p}");
                client.query_with_progress(&vectors, k, batch_size, &mut report)?
            } else {
                client.query(&vectors, k, batch_size)?
            };
            write_results(io::stdout().lock(), &result)?;
        }
        Action::QueryFile {
            file,
            dataset,
            k,
            batch_size,
        } => {
            let result = client.query_from_file(&file, &dataset, k, batch_size)?;
            write_results(io::stdout().lock(), &result)?;
        }
    }

    eprintln!("{}", client.timings());
    client.close();
    Ok(())
}

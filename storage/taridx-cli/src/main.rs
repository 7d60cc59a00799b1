use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{error::Error, reindex::reindex_tarfiles};

mod error;
mod reindex;

/// Command-line maintenance for taridx archives: rebuilds the sidecar
/// index pair from the tar payload, several archives in parallel.
#[derive(Parser)]
enum TaridxCli {
    /// Rebuild the index files of one or more tar archives
    Reindex {
        /// Number of archives to reindex concurrently
        #[arg(short = 'n', long = "nprocesses", default_value_t = 1)]
        jobs: usize,
        /// Paths or glob patterns of archives to reindex
        #[arg(required = true)]
        tarfiles: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            ),
        )
        .init();

    match TaridxCli::parse() {
        TaridxCli::Reindex { jobs, tarfiles } => reindex_tarfiles(jobs, &tarfiles).await?,
    }

    Ok(())
}

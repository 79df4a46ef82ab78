/*
 * Sparkify data lake ETL
 *
 * Builds a star schema of partitioned Parquet tables from the song catalog
 * and the user activity logs:
 *
 * 1. Song stage: reads song metadata JSON and writes
 *    - songs (partitioned by year, artist_id)
 *    - artists
 *
 * 2. Log stage: reads the activity log JSON lines, keeps NextSong events and
 *    writes
 *    - users
 *    - time (partitioned by year, month)
 *    - song_plays (partitioned by year, month), joined against the songs and
 *      artists tables written by the song stage
 *
 * Input and output live on S3 or on a local directory; see dl.example.toml.
 */

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod log_stage;
mod pipeline;
mod records;
mod session;
mod song_stage;
mod storage;
mod table_io;

#[cfg(test)]
mod test_support;

use config::Config;
use session::Session;

#[derive(Parser, Debug)]
#[clap(version, about = "Builds the Sparkify star schema from song and log JSON")]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[clap(short, long, default_value = "dl.toml")]
    pub config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    if let Err(e) = run(cli_args).await {
        error!("Run failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli_args: CliArgs) -> Result<()> {
    let started = Instant::now();

    let config = Config::load(&cli_args.config)?;
    info!("Loaded configuration from {:?}", cli_args.config);

    let session = Session::bootstrap(&config).await?;
    let summary = pipeline::run(&session).await?;

    info!(
        "Finished in {:.1?}: {} songs, {} artists, {} users, {} time rows, {} song plays",
        started.elapsed(),
        summary.songs.songs.rows,
        summary.songs.artists.rows,
        summary.logs.users.rows,
        summary.logs.time.rows,
        summary.logs.songplays.rows
    );
    Ok(())
}

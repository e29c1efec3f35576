//! dempile CLI - pile up elevation surveys and fit dh/dt rates

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

use dempile::{DemPile, DhdtConfig};

#[derive(Parser)]
#[command(name = "dempile")]
#[command(author, version, about = "Per-pixel rate of elevation change from repeat surveys", long_about = None)]
struct Cli {
    /// JSON run configuration
    config: PathBuf,

    /// Reuse the time series snapshot instead of piling up the surveys again
    #[arg(long)]
    from_snapshot: bool,

    /// Stop after piling up and writing the snapshot
    #[arg(long, conflicts_with = "from_snapshot")]
    pile_only: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let start = Instant::now();

    let config = DhdtConfig::from_json_file(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    let mut pile = DemPile::new();
    pile.read_config(&config).context("Failed to read surveys")?;

    if cli.from_snapshot {
        pile.load_snapshot().context("Failed to load time series snapshot")?;
    } else {
        pile.pile_up().context("Pile-up failed")?;
        pile.dump_snapshot().context("Failed to write time series snapshot")?;
    }
    if cli.pile_only {
        log::info!("Done in {:.1?}", start.elapsed());
        return Ok(());
    }

    pile.polyfit().context("Fitting failed")?;
    let written = pile.fitdata_to_files().context("Failed to write output")?;
    for path in &written {
        println!("{}", path.display());
    }

    log::info!("Done in {:.1?}", start.elapsed());
    Ok(())
}

use clap::Parser;
use eyre::Result;

use save_snapshots::{Cli, run};

fn main() -> Result<()> {
    let _tracing_guard = env_tracing_logger::init();
    let cli = Cli::parse();
    let n_snaps = run(cli)?;
    tracing::info!("{n_snaps} images saved.");
    Ok(())
}

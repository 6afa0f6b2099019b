use clap::Parser;
use eyre::Result;

use offline_checkerboards::{Cli, run_cal};

fn main() -> Result<()> {
    let _tracing_guard = env_tracing_logger::init();
    let cli = Cli::parse();
    let output = run_cal(cli)?;
    for fname in output.files.iter() {
        tracing::info!("Wrote {fname}");
    }
    Ok(())
}

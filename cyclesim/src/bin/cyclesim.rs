// Runs the built-in counter model, optionally in lockstep with other
// simulator processes:
//
//   cyclesim +barrier_uri=/dev/shm/run0 +barrier_leader=1 +barrier_procs=3 &
//   cyclesim +barrier_uri=/dev/shm/run0 +barrier_procs=3 &
//   cyclesim +barrier_uri=/dev/shm/run0 +barrier_procs=3
use std::process;
use std::sync::atomic::Ordering;

use anyhow::Context;
use chrono::Utc;
use cyclesim::{init_logging, summary, CounterModel, Driver, SimCli};
use log::{error, info};

fn run(cli: &SimCli) -> anyhow::Result<()> {
    let run_start_ts = Utc::now();
    let config = cli.to_config()?;
    let mut driver = Driver::new(CounterModel::new(cli.finish_at), config);

    let stop = driver.stop_flag();
    ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
        .context("Error setting Ctrl-C handler")?;

    let result = driver.run()?;
    info!(
        "Simulation ended after {} cycles ({:?}), sim time {} ps",
        result.cycles, result.stop_reason, result.sim_time
    );

    if !cli.summary.is_empty() {
        summary::write_summary(&cli.summary, cli, &result, run_start_ts, Utc::now())
            .with_context(|| format!("writing run summary to {}", cli.summary))?;
    }
    Ok(())
}

fn main() {
    init_logging("info");
    let cli = match SimCli::parse_args(std::env::args()) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };
    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        process::exit(1);
    }
}

use std::io::{self, Write};

use anyhow::Context;
use clap::{error::ErrorKind, CommandFactory, Parser};
use mrk::{
    config::{set_logger, BenchArgs},
    report, Benchmark, StopHandle,
};

/// Exit status used when a second interrupt arrives while the run is winding down.
const INTERRUPTED: i32 = 130;

fn main() -> anyhow::Result<()> {
    let args = BenchArgs::parse();
    set_logger(args.log_level);
    let json = args.json;
    let config = match args.build() {
        Ok(config) => config,
        Err(err) => BenchArgs::command()
            .error(ErrorKind::ValueValidation, err)
            .exit(),
    };

    let (stop, stop_rx) = StopHandle::new();
    ctrlc::set_handler(move || {
        if !stop.request() {
            std::process::exit(INTERRUPTED);
        }
    })
    .context("failed to install interrupt handler")?;

    let bench = Benchmark::new(config).stop_on(stop_rx);
    let target = bench.config().url.to_string();
    bench
        .check()
        .with_context(|| format!("cannot benchmark {target}"))?;

    let mut stdout = io::stdout().lock();
    if !json {
        report::write_banner(&mut stdout, bench.config())?;
        stdout.flush()?;
    }

    let summary = bench
        .run()
        .with_context(|| format!("benchmark against {target} failed"))?;

    if json {
        report::write_json(&mut stdout, &summary)?;
    } else {
        report::write_text(&mut stdout, &summary)?;
    }
    Ok(())
}

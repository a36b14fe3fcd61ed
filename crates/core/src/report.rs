//! Human readable and JSON rendering of a [`Summary`].

use std::io::{self, Write};

use crate::{
    config::Config,
    coordinator::Summary,
    histogram::Histogram,
    units::{format_binary, format_metric, format_time_s, format_time_us},
};

const DISTRIBUTION: [f64; 4] = [50.0, 75.0, 90.0, 99.0];

pub fn write_banner(out: &mut impl Write, config: &Config) -> io::Result<()> {
    writeln!(
        out,
        "Running mrk for {} @ {}",
        format_time_s(config.duration.as_secs_f64()),
        config.url
    )?;
    writeln!(
        out,
        "  {} threads and {} connections",
        config.threads, config.connections
    )
}

pub fn write_text(out: &mut impl Write, summary: &Summary) -> io::Result<()> {
    writeln!(
        out,
        "  Thread Stats{:>6}{:>11}{:>8}{:>12}",
        "Avg", "Stdev", "Max", "+/- Stdev"
    )?;
    write_stats(out, "Latency", &summary.latency, format_time_us)?;
    write_stats(out, "Req/Sec", &summary.throughput, format_metric)?;

    if summary.config.print_latency {
        writeln!(out, "  Latency Distribution")?;
        for p in DISTRIBUTION {
            let value = summary.latency.percentile(p) as f64;
            writeln!(out, "  {p:>7.0}%{}", pad_units(value, format_time_us, 10))?;
        }
    }

    let totals = &summary.totals;
    writeln!(
        out,
        "  {} requests in {}, {}B sent, {}B read",
        totals.completed,
        format_time_us(summary.elapsed.as_micros() as f64, 0),
        format_binary(totals.bytes_sent as f64),
        format_binary(totals.bytes_received as f64)
    )?;

    let errors = &totals.errors;
    if errors.socket_errors() > 0 {
        writeln!(
            out,
            "  Socket errors: connect {}, read {}, write {}, timeout {}",
            errors.connect, errors.read, errors.write, errors.timeout
        )?;
    }
    if errors.status > 0 {
        writeln!(out, "  Non-2xx or 3xx responses: {}", errors.status)?;
    }

    writeln!(out, "Requests/sec: {:9.2}", summary.requests_per_sec)?;
    writeln!(
        out,
        "Transfer/sec: {:>10}B",
        format_binary(summary.transfer_per_sec)
    )
}

pub fn write_json(out: &mut impl Write, summary: &Summary) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, summary)?;
    writeln!(out)
}

fn write_stats(
    out: &mut impl Write,
    name: &str,
    hist: &Histogram,
    normalize: fn(f64, usize) -> String,
) -> io::Result<()> {
    let mean = hist.mean();
    let stdev = hist.stdev(mean);
    writeln!(
        out,
        "    {name:<10}{}{}{}{:8.2}%",
        pad_units(mean, normalize, 8),
        pad_units(stdev, normalize, 10),
        pad_units(hist.max() as f64, normalize, 9),
        hist.within_stdev(mean, stdev, 1)
    )
}

/// Right-aligns a formatted quantity so that numbers line up whether or not a unit suffix
/// (zero to two letters) follows them.
fn pad_units(n: f64, normalize: fn(f64, usize) -> String, width: usize) -> String {
    let msg = normalize(n, 2);
    let suffix = msg
        .chars()
        .rev()
        .take(2)
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    let pad = 2 - suffix;
    let width = width - pad;
    format!("{msg:>width$.width$}{}", " ".repeat(pad))
}

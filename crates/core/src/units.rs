//! Scanning and formatting of SI metric, binary and time units.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitsError {
    #[error("missing numeric value")]
    Empty,
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("unknown unit `{unit}`, expected one of: {expected}")]
    UnknownUnit { unit: String, expected: String },
    #[error("value `{0}` overflows")]
    Overflow(String),
}

/// A family of units where each step is `scale` times the previous one.
struct Units {
    scale: u64,
    base: &'static str,
    values: &'static [&'static str],
}

const TIME_US: Units = Units {
    scale: 1000,
    base: "us",
    values: &["ms", "s"],
};

const TIME_S: Units = Units {
    scale: 60,
    base: "s",
    values: &["m", "h"],
};

const BINARY: Units = Units {
    scale: 1024,
    base: "",
    values: &["K", "M", "G", "T", "P"],
};

const METRIC: Units = Units {
    scale: 1000,
    base: "",
    values: &["k", "M", "G", "T", "P"],
};

fn format_units(n: f64, units: &Units, precision: usize) -> String {
    let mut amount = n;
    let mut unit = units.base;
    let threshold = units.scale as f64 * 0.85;

    for value in units.values {
        if amount < threshold {
            break;
        }
        amount /= units.scale as f64;
        unit = value;
    }

    format!("{amount:.precision$}{unit}")
}

fn scan_units(s: &str, units: &Units) -> Result<u64, UnitsError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(UnitsError::Empty);
    }

    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let base: u64 = digits
        .parse()
        .map_err(|_| UnitsError::InvalidNumber(digits.to_owned()))?;

    if unit.is_empty() || unit == units.base {
        return Ok(base);
    }

    let position = units
        .values
        .iter()
        .position(|v| *v == unit)
        .ok_or_else(|| UnitsError::UnknownUnit {
            unit: unit.to_owned(),
            expected: units.values.join(", "),
        })?;

    let scale = (0..=position).try_fold(1u64, |acc, _| acc.checked_mul(units.scale));
    scale
        .and_then(|scale| base.checked_mul(scale))
        .ok_or_else(|| UnitsError::Overflow(s.to_owned()))
}

/// Parses a count with an optional SI suffix (`10`, `1k`, `2M`).
pub fn scan_metric(s: &str) -> Result<u64, UnitsError> {
    scan_units(s, &METRIC)
}

/// Parses a whole number of seconds with an optional time suffix (`30`, `30s`, `2m`, `1h`).
pub fn scan_time(s: &str) -> Result<Duration, UnitsError> {
    scan_units(s, &TIME_S).map(Duration::from_secs)
}

pub fn format_binary(n: f64) -> String {
    format_units(n, &BINARY, 2)
}

pub fn format_metric(n: f64, precision: usize) -> String {
    format_units(n, &METRIC, precision)
}

/// Formats a microsecond quantity, switching to seconds/minutes/hours past one second.
pub fn format_time_us(n: f64, precision: usize) -> String {
    if n >= 1_000_000.0 {
        format_units(n / 1_000_000.0, &TIME_S, precision)
    } else {
        format_units(n, &TIME_US, precision)
    }
}

pub fn format_time_s(n: f64) -> String {
    format_units(n, &TIME_S, 0)
}

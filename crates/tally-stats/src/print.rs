//! Human-readable reports of reduced records.
//!
//! Two layouts: a block per variable, or one condensed line per variable.
//! Either can be followed by a `Summary = [ ... ];` line listing the averages
//! in a form array-literal parsers accept.

use std::io::{self, Write};

use tally_group::Communicator;

use crate::record::{StatRecord, Status};

/// What to print.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrintOptions {
    /// Full block per variable instead of one condensed line.
    pub full: bool,
    /// Append the summary line.
    pub summary: bool,
}

impl PrintOptions {
    pub fn new(full: bool, summary: bool) -> Self {
        Self { full, summary }
    }
}

/// Write a report of `records` to `out`. Without a sink nothing happens.
///
/// Call on one participant only, or use [`print_root`].
pub fn print(records: &[StatRecord], options: PrintOptions, out: Option<&mut dyn Write>) -> io::Result<()> {
    let Some(out) = out else {
        return Ok(());
    };

    for (i, record) in records.iter().enumerate() {
        if options.full {
            write_full(out, i, record)?;
        } else {
            write_condensed(out, i, record)?;
        }
    }

    if options.summary {
        out.write_all(b"Summary = [")?;
        for record in records {
            if record.status != Status::Reduced {
                out.write_all(b" NaN")?;
            } else {
                write!(out, " {}", format_g(record.average, 6))?;
            }
        }
        out.write_all(b" ];\n")?;
    }

    out.flush()
}

/// [`print`] on rank 0, a no-op elsewhere.
pub fn print_root<C: Communicator + ?Sized>(
    comm: &C,
    records: &[StatRecord],
    options: PrintOptions,
    out: Option<&mut dyn Write>,
) -> io::Result<()> {
    if comm.rank() != 0 {
        return Ok(());
    }
    print(records, options, out)
}

fn write_full(out: &mut dyn Write, index: usize, record: &StatRecord) -> io::Result<()> {
    match &record.label {
        Some(label) => writeln!(out, "Statistics for variable: {label}")?,
        None => writeln!(out, "Statistics for variable no. {index}")?,
    }
    writeln!(out, "   Global number of values: {:5}", record.count)?;
    if let Some(note) = missing_statistics(record) {
        return writeln!(out, "   Mean value (std. dev.):         {note}");
    }
    writeln!(out, "   Mean value (std. dev.):         {}", mean_and_deviation(record))?;
    writeln!(
        out,
        "   Minimum attained at rank {:5}: {}",
        record.min_at_rank,
        format_g(record.min, 6)
    )?;
    writeln!(
        out,
        "   Maximum attained at rank {:5}: {}",
        record.max_at_rank,
        format_g(record.max, 6)
    )
}

fn write_condensed(out: &mut dyn Write, index: usize, record: &StatRecord) -> io::Result<()> {
    let name = match &record.label {
        Some(label) => format!("for variable {label}:"),
        None => format!("for variable no. {index}:"),
    };
    if let Some(note) = missing_statistics(record) {
        return writeln!(out, "Mean value (std. dev.) {name:<28} {note}");
    }
    writeln!(out, "Mean value (std. dev.) {name:<28} {}", mean_and_deviation(record))
}

/// What to print instead of the mean when the derived fields are not valid.
fn missing_statistics(record: &StatRecord) -> Option<&'static str> {
    match record.status {
        Status::Reduced => None,
        Status::Empty => Some("no data"),
        Status::Local => Some("not reduced"),
    }
}

/// `avg (sd = pct%)`, or `avg (sd)` when the average is zero.
fn mean_and_deviation(record: &StatRecord) -> String {
    let avg = format_g(record.average, 6);
    let sd = format_g(record.standard_deviation, 3);
    if record.average != 0.0 {
        let pct = 100.0 * record.standard_deviation / record.average.abs();
        format!("{avg} ({sd} = {}%)", format_g(pct, 3))
    } else {
        format!("{avg} ({sd})")
    }
}

/// Format like C's `%.<precision>g`.
///
/// `precision` significant digits, trailing zeros dropped, scientific
/// notation when the exponent is below -4 or at least `precision`.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let precision = precision.max(1);
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to the requested digits first; the exponent can move (9.99 -> 10).
    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

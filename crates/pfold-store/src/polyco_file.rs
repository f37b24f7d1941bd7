//! TEMPO polyco text files.
//!
//! Each record is two header lines followed by `ncoeff` coefficients,
//! three to a line:
//!
//! ```text
//! 1937+21    15-Jun-09  120000.00   54997.50000000000  71.0249 -0.345 -6.112
//! 1234567.123456   641.928262370938    1   60   12   1400.000
//!  0.12345678901234567D-03 -0.22345678901234567D-06  0.32345678901234567D-09
//!  ...
//! ```
//!
//! Fields are read as whitespace-separated tokens. The reference epoch
//! (TMID) is parsed with [`MjdEpoch`]'s split-precision parser.
//!
//! TMID is taken as the start of the record's window, so a record covers
//! `[TMID, TMID + span)`. TEMPO itself centres the span on TMID, so
//! files generated by TEMPO need TMID set half a span early to cover the
//! same interval.

use std::fs;
use std::path::Path;

use pfold_core::{MjdEpoch, PolycoRecord};
use tracing::debug;

use crate::error::{Result, StoreError};

/// Parse every record in `path`. Fails if the file cannot be read, a
/// record is malformed, or no record is found.
pub fn parse_all(path: &Path) -> Result<Vec<PolycoRecord>> {
    let text = fs::read_to_string(path)?;
    let records = parse_str(&text)?;
    debug!(path = %path.display(), records = records.len(), "parsed polyco file");
    Ok(records)
}

pub fn parse_str(text: &str) -> Result<Vec<PolycoRecord>> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim().is_empty())
        .peekable();

    let mut records = Vec::new();
    while let Some((line1, head1)) = lines.next() {
        let t1: Vec<&str> = head1.split_whitespace().collect();
        if t1.len() < 4 {
            return Err(err(line1, "expected PSR, date, UTC and TMID"));
        }
        let source = t1[0].to_string();
        let epoch: MjdEpoch = t1[3].parse().map_err(|e| err(line1, e))?;

        let (line2, head2) = lines
            .next()
            .ok_or_else(|| err(line1, "record truncated after first header line"))?;
        let t2: Vec<&str> = head2.split_whitespace().collect();
        if t2.len() < 6 {
            return Err(err(
                line2,
                "expected RPHASE, F0, site, span, ncoeff and observing frequency",
            ));
        }
        let ref_phase = number(line2, t2[0])?;
        let ref_freq = number(line2, t2[1])?;
        let site = t2[2].to_string();
        let span_minutes = number(line2, t2[3])?;
        let ncoeff: usize = t2[4].parse().map_err(|_| err(line2, format!("bad ncoeff '{}'", t2[4])))?;
        let obs_freq = number(line2, t2[5])?;
        if ncoeff == 0 {
            return Err(err(line2, "ncoeff must be at least 1"));
        }

        let mut coeffs = Vec::with_capacity(ncoeff);
        while coeffs.len() < ncoeff {
            let (n, line) = lines
                .next()
                .ok_or_else(|| err(line2, format!("expected {ncoeff} coefficients, found {}", coeffs.len())))?;
            for tok in line.split_whitespace() {
                coeffs.push(number(n, tok)?);
            }
        }
        if coeffs.len() != ncoeff {
            return Err(err(line2, format!("expected {ncoeff} coefficients, found {}", coeffs.len())));
        }

        records.push(PolycoRecord {
            source,
            epoch,
            ref_phase,
            ref_freq,
            obs_freq,
            span_minutes,
            site,
            coeffs,
        });
    }

    if records.is_empty() {
        return Err(err(0, "no polyco records found"));
    }
    Ok(records)
}

/// Render records in the layout [`parse_str`] reads.
pub fn format_records(records: &[PolycoRecord]) -> String {
    let mut out = String::new();
    for pc in records {
        let span = if pc.span_minutes.is_finite() {
            pc.span_minutes
        } else {
            1440.0
        };
        out.push_str(&format!(
            "{:<10} {:>9} {:>11} {:>20} {:>10} {:>7} {:>7}\n",
            pc.source, "01-Jan-00", "000000.00", pc.epoch.to_string(), "0.0000", "0.000", "-6.000"
        ));
        out.push_str(&format!(
            "{:>20.6} {:>18.12} {:>4} {:>5} {:>4} {:>10.3}\n",
            pc.ref_phase,
            pc.ref_freq,
            if pc.site.is_empty() { "@" } else { pc.site.as_str() },
            span,
            pc.coeffs.len(),
            pc.obs_freq
        ));
        for chunk in pc.coeffs.chunks(3) {
            let line: Vec<String> = chunk.iter().map(|c| format!("{:>25}", fortran_exp(*c))).collect();
            out.push_str(&line.join(""));
            out.push('\n');
        }
    }
    out
}

fn fortran_exp(v: f64) -> String {
    format!("{v:.17e}").replace('e', "D")
}

fn number(line: usize, tok: &str) -> Result<f64> {
    tok.replace(['D', 'd'], "E")
        .parse::<f64>()
        .map_err(|_| err(line, format!("bad number '{tok}'")))
}

fn err(line: usize, msg: impl ToString) -> StoreError {
    StoreError::Polyco {
        line,
        msg: msg.to_string(),
    }
}

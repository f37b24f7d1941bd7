//! Split-precision Modified Julian Day epochs.
//!
//! An MJD near 60000 stored as a single `f64` keeps only ~1µs of
//! resolution, which is marginal over hours-long polyco spans. Epochs are
//! kept as an integer day plus a fractional day so that differences
//! between nearby instants are computed without cancellation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{MINUTES_PER_DAY, SECONDS_PER_DAY};

/// An instant as integer MJD plus fractional day in `[0, 1)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MjdEpoch {
    pub imjd: i64,
    pub fmjd: f64,
}

impl MjdEpoch {
    /// Build an epoch, carrying whole days out of `fmjd`.
    pub fn new(imjd: i64, fmjd: f64) -> Self {
        let carry = fmjd.floor();
        let mut epoch = Self {
            imjd: imjd + carry as i64,
            fmjd: fmjd - carry,
        };
        // fmjd - floor(fmjd) can round up to exactly 1.0 for tiny negatives
        if epoch.fmjd >= 1.0 {
            epoch.imjd += 1;
            epoch.fmjd -= 1.0;
        }
        epoch
    }

    /// Split a single-precision MJD. Loses sub-µs detail; prefer `parse`.
    pub fn from_mjd(mjd: f64) -> Self {
        Self::new(0, mjd)
    }

    pub fn as_mjd(self) -> f64 {
        self.imjd as f64 + self.fmjd
    }

    /// The instant `secs` seconds later (or earlier when negative).
    pub fn add_seconds(self, secs: f64) -> Self {
        Self::new(self.imjd, self.fmjd + secs / SECONDS_PER_DAY)
    }

    /// Signed minutes elapsed from `earlier` to `self`.
    pub fn minutes_since(self, earlier: MjdEpoch) -> f64 {
        (self.imjd - earlier.imjd) as f64 * MINUTES_PER_DAY
            + (self.fmjd - earlier.fmjd) * MINUTES_PER_DAY
    }

    /// Signed seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(self, earlier: MjdEpoch) -> f64 {
        (self.imjd - earlier.imjd) as f64 * SECONDS_PER_DAY
            + (self.fmjd - earlier.fmjd) * SECONDS_PER_DAY
    }
}

impl fmt::Display for MjdEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frac = format!("{:.12}", self.fmjd);
        match frac.strip_prefix("0.") {
            Some(digits) => write!(f, "{}.{digits}", self.imjd),
            // fmjd rounded up to 1.000000000000
            None => write!(f, "{}.{}", self.imjd + 1, "0".repeat(12)),
        }
    }
}

/// Error returned when an MJD string cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid MJD '{0}'")]
pub struct ParseMjdError(pub String);

impl FromStr for MjdEpoch {
    type Err = ParseMjdError;

    /// Parse `"53000.123456789012"` keeping integer and fraction separate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ParseMjdError(s.to_string());
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.starts_with('-') {
            return Err(err());
        }
        let imjd: i64 = int_part.parse().map_err(|_| err())?;
        let fmjd = if frac_part.is_empty() {
            0.0
        } else {
            if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            format!("0.{frac_part}").parse::<f64>().map_err(|_| err())?
        };
        Ok(Self::new(imjd, fmjd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_fraction() {
        let e = MjdEpoch::new(50000, 1.25);
        assert_eq!(e.imjd, 50001);
        assert!((e.fmjd - 0.25).abs() < 1e-15);

        let e = MjdEpoch::new(50000, -0.25);
        assert_eq!(e.imjd, 49999);
        assert!((e.fmjd - 0.75).abs() < 1e-15);
    }

    #[test]
    fn test_add_seconds_crosses_midnight() {
        let e = MjdEpoch::new(55000, 0.999).add_seconds(172.8);
        assert_eq!(e.imjd, 55001);
        assert!((e.fmjd - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_minutes_since_keeps_subsecond_resolution() {
        let a = MjdEpoch::new(60000, 0.5);
        let b = a.add_seconds(1e-4);
        let dt_secs = b.minutes_since(a) * 60.0;
        assert!((dt_secs - 1e-4).abs() < 1e-9, "got {dt_secs}");
    }

    #[test]
    fn test_parse_splits_integer_and_fraction() {
        let e: MjdEpoch = "53005.123456789012".parse().unwrap();
        assert_eq!(e.imjd, 53005);
        assert!((e.fmjd - 0.123456789012).abs() < 1e-15);

        let whole: MjdEpoch = "53005".parse().unwrap();
        assert_eq!(whole, MjdEpoch::new(53005, 0.0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<MjdEpoch>().is_err());
        assert!("abc.5".parse::<MjdEpoch>().is_err());
        assert!("5300.1e3".parse::<MjdEpoch>().is_err());
        assert!("-5.5".parse::<MjdEpoch>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MjdEpoch::new(53005, 0.5).to_string(), "53005.500000000000");
        assert_eq!(
            MjdEpoch::new(53005, 0.9999999999999).to_string(),
            "53006.000000000000"
        );
    }
}

//! Polynomial phase prediction ("polycos").
//!
//! A polyco record approximates pulsar rotational phase over a short span
//! as a polynomial in minutes elapsed since its reference epoch:
//!
//! ```text
//! phase(Δ) = rphase + 60·f0·Δ + Σ c_i·Δ^i
//! freq(Δ)  = f0 + (Σ i·c_i·Δ^(i-1)) / 60        [Hz]
//! ```
//!
//! A record is valid over `[epoch, epoch + span_minutes)`.

use serde::{Deserialize, Serialize};

use crate::constants::WILDCARD_SOURCE;
use crate::error::{FoldError, NoMatch, Result};
use crate::time::MjdEpoch;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolycoRecord {
    pub source: String,
    pub epoch: MjdEpoch,
    /// Rotational phase at `epoch`, in turns.
    pub ref_phase: f64,
    /// Rotational frequency at `epoch`, in Hz.
    pub ref_freq: f64,
    /// Radio frequency the prediction refers to, in MHz.
    pub obs_freq: f64,
    /// Validity span in minutes; `f64::INFINITY` for a fixed-frequency record.
    pub span_minutes: f64,
    pub site: String,
    pub coeffs: Vec<f64>,
}

/// Phase (turns, not wrapped) and instantaneous frequency (Hz).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhasePrediction {
    pub phase: f64,
    pub frequency: f64,
}

impl PolycoRecord {
    /// Synthesize a record folding at a fixed rotational frequency.
    pub fn constant(freq_hz: f64, epoch: MjdEpoch, obs_freq: f64) -> Self {
        Self {
            source: WILDCARD_SOURCE.to_string(),
            epoch,
            ref_phase: 0.0,
            ref_freq: freq_hz,
            obs_freq,
            span_minutes: f64::INFINITY,
            site: String::new(),
            coeffs: vec![0.0],
        }
    }

    pub fn minutes_from_epoch(&self, at: MjdEpoch) -> f64 {
        at.minutes_since(self.epoch)
    }

    pub fn covers(&self, at: MjdEpoch) -> bool {
        let dt = self.minutes_from_epoch(at);
        dt >= 0.0 && dt < self.span_minutes
    }

    /// `None` matches any record; `*` records match any query.
    pub fn matches_source(&self, query: Option<&str>) -> bool {
        let Some(query) = query else {
            return true;
        };
        self.source == WILDCARD_SOURCE
            || self.source == query
            || bare_psr_name(&self.source) == bare_psr_name(query)
    }

    /// Evaluate phase and frequency `dt` minutes after the reference epoch.
    pub fn predict(&self, dt: f64) -> PhasePrediction {
        let mut poly = 0.0;
        let mut deriv = 0.0;
        for (i, &c) in self.coeffs.iter().enumerate().rev() {
            poly = poly * dt + c;
            if i > 0 {
                deriv = deriv * dt + i as f64 * c;
            }
        }
        PhasePrediction {
            phase: self.ref_phase + self.ref_freq * 60.0 * dt + poly,
            frequency: self.ref_freq + deriv / 60.0,
        }
    }

    pub fn predict_at(&self, at: MjdEpoch) -> PhasePrediction {
        self.predict(self.minutes_from_epoch(at))
    }
}

/// Strip a leading `J`/`B` catalogue prefix so `B1937+21` matches `1937+21`.
fn bare_psr_name(name: &str) -> &str {
    let trimmed = name.trim();
    match trimmed.as_bytes() {
        [b'J' | b'B', d, ..] if d.is_ascii_digit() => &trimmed[1..],
        _ => trimmed,
    }
}

/// Map a phase in turns to a bin index in `[0, nbin)`.
pub fn phase_bin(phase: f64, nbin: usize) -> usize {
    let frac = phase.rem_euclid(1.0);
    ((frac * nbin as f64) as usize) % nbin
}

/// Ordered polyco set; insertion order is validity order.
#[derive(Clone, Debug)]
pub struct PhaseEphemeris {
    records: Vec<PolycoRecord>,
}

impl PhaseEphemeris {
    pub fn new(records: Vec<PolycoRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(FoldError::Setup("ephemeris has no polyco records".into()));
        }
        Ok(Self { records })
    }

    /// Fixed-period folding: one record, zero polynomial, wildcard source.
    pub fn constant(freq_hz: f64, epoch: MjdEpoch, obs_freq: f64) -> Result<Self> {
        if !(freq_hz.is_finite() && freq_hz > 0.0) {
            return Err(FoldError::Setup(format!(
                "fold frequency must be positive, got {freq_hz}"
            )));
        }
        Self::new(vec![PolycoRecord::constant(freq_hz, epoch, obs_freq)])
    }

    pub fn records(&self) -> &[PolycoRecord] {
        &self.records
    }

    /// First record matching `source` whose window contains `at`.
    pub fn select(&self, source: Option<&str>, at: MjdEpoch) -> std::result::Result<&PolycoRecord, NoMatch> {
        self.records
            .iter()
            .find(|pc| pc.matches_source(source) && pc.covers(at))
            .ok_or_else(|| NoMatch {
                psr: source.unwrap_or(WILDCARD_SOURCE).to_string(),
                epoch: at,
            })
    }

    /// Phase (unwrapped turns) and frequency (Hz) of `record` at `at`.
    pub fn phase_and_frequency(record: &PolycoRecord, at: MjdEpoch) -> (f64, f64) {
        let p = record.predict_at(at);
        (p.phase, p.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(source: &str, imjd: i64, fmjd: f64, span: f64) -> PolycoRecord {
        PolycoRecord {
            source: source.to_string(),
            epoch: MjdEpoch::new(imjd, fmjd),
            ref_phase: 0.25,
            ref_freq: 10.0,
            obs_freq: 1400.0,
            span_minutes: span,
            site: "1".to_string(),
            coeffs: vec![0.0, 1e-3, 2e-6],
        }
    }

    #[test]
    fn test_predict_at_epoch() {
        let pc = record("1937+21", 55000, 0.0, 60.0);
        let p = pc.predict(0.0);
        assert_relative_eq!(p.phase, 0.25);
        assert_relative_eq!(p.frequency, 10.0 + 1e-3 / 60.0);
    }

    #[test]
    fn test_predict_polynomial_terms() {
        let pc = record("1937+21", 55000, 0.0, 60.0);
        let dt = 3.0;
        let p = pc.predict(dt);
        let expected_phase = 0.25 + 10.0 * 60.0 * dt + 1e-3 * dt + 2e-6 * dt * dt;
        let expected_freq = 10.0 + (1e-3 + 2.0 * 2e-6 * dt) / 60.0;
        assert_relative_eq!(p.phase, expected_phase, max_relative = 1e-14);
        assert_relative_eq!(p.frequency, expected_freq, max_relative = 1e-14);
    }

    #[test]
    fn test_phase_advances_by_frequency_times_interval() {
        let pc = record("1937+21", 55000, 0.0, 120.0);
        let t0 = MjdEpoch::new(55000, 0.01);
        let dt_secs = 1e-3;
        let (p0, f0) = PhaseEphemeris::phase_and_frequency(&pc, t0);
        let (p1, _) = PhaseEphemeris::phase_and_frequency(&pc, t0.add_seconds(dt_secs));
        assert!(p1 > p0);
        assert_relative_eq!(p1 - p0, f0 * dt_secs, max_relative = 1e-6);
    }

    #[test]
    fn test_select_respects_window_and_order() {
        let eph = PhaseEphemeris::new(vec![
            record("1937+21", 55000, 0.0, 60.0),
            record("1937+21", 55000, 60.0 / 1440.0, 60.0),
        ])
        .unwrap();
        let early = MjdEpoch::new(55000, 30.0 / 1440.0);
        let late = MjdEpoch::new(55000, 90.0 / 1440.0);
        assert_eq!(eph.select(Some("1937+21"), early).unwrap().epoch, MjdEpoch::new(55000, 0.0));
        assert_eq!(
            eph.select(Some("1937+21"), late).unwrap().epoch,
            MjdEpoch::new(55000, 60.0 / 1440.0)
        );
    }

    #[test]
    fn test_select_no_match_outside_window() {
        let eph = PhaseEphemeris::new(vec![record("1937+21", 55000, 0.5, 60.0)]).unwrap();
        let before = MjdEpoch::new(55000, 0.4);
        let after = MjdEpoch::new(55000, 0.6);
        let err = eph.select(Some("1937+21"), before).unwrap_err();
        assert_eq!(err.psr, "1937+21");
        assert!(eph.select(Some("1937+21"), after).is_err());
    }

    #[test]
    fn test_select_source_matching() {
        let eph = PhaseEphemeris::new(vec![record("1937+21", 55000, 0.0, 60.0)]).unwrap();
        let t = MjdEpoch::new(55000, 0.01);
        assert!(eph.select(Some("B1937+21"), t).is_ok());
        assert!(eph.select(None, t).is_ok());
        assert!(eph.select(Some("0329+54"), t).is_err());
    }

    #[test]
    fn test_constant_ephemeris_matches_everything_after_start() {
        let start = MjdEpoch::new(56000, 0.2);
        let eph = PhaseEphemeris::constant(2.0, start, 1500.0).unwrap();
        let later = start.add_seconds(5.0 * 86_400.0);
        let pc = eph.select(Some("J0000+0000"), later).unwrap();
        let (phase, freq) = PhaseEphemeris::phase_and_frequency(pc, later);
        assert_relative_eq!(freq, 2.0);
        assert_relative_eq!(phase, 2.0 * 5.0 * 86_400.0, max_relative = 1e-9);
    }

    #[test]
    fn test_constant_rejects_bad_frequency() {
        let start = MjdEpoch::new(56000, 0.0);
        assert!(PhaseEphemeris::constant(0.0, start, 1500.0).is_err());
        assert!(PhaseEphemeris::constant(f64::NAN, start, 1500.0).is_err());
    }

    #[test]
    fn test_empty_ephemeris_is_setup_error() {
        assert!(matches!(PhaseEphemeris::new(vec![]), Err(FoldError::Setup(_))));
    }

    #[test]
    fn test_phase_bin_wraps_negative_and_large() {
        assert_eq!(phase_bin(0.0, 256), 0);
        assert_eq!(phase_bin(0.999_999, 256), 255);
        assert_eq!(phase_bin(-0.25, 4), 3);
        assert_eq!(phase_bin(1e6 + 0.5, 2), 1);
        assert_eq!(phase_bin(-1e-18, 8), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_phase_bin_in_range(phase in -1e9f64..1e9, nbin in 1usize..4096) {
            let bin = phase_bin(phase, nbin);
            proptest::prop_assert!(bin < nbin);
            proptest::prop_assert_eq!(bin, phase_bin(phase, nbin));
        }
    }
}

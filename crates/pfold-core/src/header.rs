use serde::{Deserialize, Serialize};

use crate::block::BlockShape;
use crate::constants::SUPPORTED_NBITS;
use crate::error::{FoldError, Result};
use crate::time::MjdEpoch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObsMode {
    #[default]
    #[serde(rename = "SEARCH")]
    Search,
    #[serde(rename = "PSR")]
    Fold,
}

/// Ordering of the four polarisation products in a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolOrder {
    /// Stokes parameters; I is the first product.
    #[default]
    #[serde(rename = "IQUV")]
    Iquv,
    /// Auto/cross products; I is the mean of AA and BB.
    #[serde(rename = "AABBCRCI")]
    AabbCrCi,
}

/// Observation-level parameters shared by every block of a scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsHeader {
    pub source: String,
    /// Observation start.
    pub epoch: MjdEpoch,
    pub nchan: usize,
    pub npol: usize,
    /// Samples per block (`NSBLK`).
    pub nsblk: usize,
    pub nbits: u32,
    /// Sample interval in seconds.
    pub tsamp: f64,
    /// Phase bins; 1 for search-mode data.
    pub nbin: usize,
    pub obs_mode: ObsMode,
    /// Centre radio frequency, MHz.
    pub center_freq: f64,
    pub bandwidth: f64,
    /// Requested scan length in seconds; 0 means unbounded.
    pub scanlen: f64,
    pub only_i: bool,
    pub ds_freq_fact: usize,
    pub ds_time_fact: usize,
    pub pol_order: PolOrder,
}

impl Default for ObsHeader {
    fn default() -> Self {
        Self {
            source: String::new(),
            epoch: MjdEpoch::default(),
            nchan: 0,
            npol: 1,
            nsblk: 0,
            nbits: SUPPORTED_NBITS,
            tsamp: 0.0,
            nbin: 1,
            obs_mode: ObsMode::Search,
            center_freq: 0.0,
            bandwidth: 0.0,
            scanlen: 0.0,
            only_i: false,
            ds_freq_fact: 1,
            ds_time_fact: 1,
            pol_order: PolOrder::Iquv,
        }
    }
}

impl ObsHeader {
    pub fn block_shape(&self) -> BlockShape {
        BlockShape::new(self.nsblk, self.npol, self.nchan)
    }

    /// Reject data the fold kernel and reduction stage cannot handle.
    pub fn validate(&self) -> Result<()> {
        if self.nbits != SUPPORTED_NBITS {
            return Err(FoldError::Setup(format!(
                "only implemented for 8-bit data (read nbits={})",
                self.nbits
            )));
        }
        if self.nchan == 0 || self.npol == 0 || self.nsblk == 0 {
            return Err(FoldError::Setup(format!(
                "empty block shape (nchan={}, npol={}, nsblk={})",
                self.nchan, self.npol, self.nsblk
            )));
        }
        if !(self.tsamp.is_finite() && self.tsamp > 0.0) {
            return Err(FoldError::Setup(format!(
                "sample interval must be positive, got {}",
                self.tsamp
            )));
        }
        if self.ds_freq_fact == 0 || self.nchan % self.ds_freq_fact != 0 {
            return Err(FoldError::Setup(format!(
                "frequency downsample factor {} does not divide nchan={}",
                self.ds_freq_fact, self.nchan
            )));
        }
        if self.ds_time_fact == 0 || self.nsblk % self.ds_time_fact != 0 {
            return Err(FoldError::Setup(format!(
                "time downsample factor {} does not divide nsblk={}",
                self.ds_time_fact, self.nsblk
            )));
        }
        Ok(())
    }

    pub fn collapses_to_stokes_i(&self) -> bool {
        self.only_i && self.npol == 4
    }

    /// Header describing blocks after the reduction stage has run.
    pub fn reduced(&self) -> ObsHeader {
        let mut out = self.clone();
        if self.collapses_to_stokes_i() {
            out.npol = 1;
        }
        out.nchan = self.nchan / self.ds_freq_fact.max(1);
        out.nsblk = self.nsblk / self.ds_time_fact.max(1);
        out.tsamp = self.tsamp * self.ds_time_fact.max(1) as f64;
        out.ds_freq_fact = 1;
        out.ds_time_fact = 1;
        out.only_i = false;
        out
    }

    /// Header for a folded archive produced from this search header.
    pub fn folded(&self, nbin: usize, source: Option<&str>) -> ObsHeader {
        let mut out = self.clone();
        out.obs_mode = ObsMode::Fold;
        out.nbin = nbin;
        if let Some(src) = source {
            out.source = src.to_string();
        }
        out
    }

    /// Duration of one block in seconds.
    pub fn block_duration(&self) -> f64 {
        self.nsblk as f64 * self.tsamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guppi_header() -> ObsHeader {
        ObsHeader {
            source: "B1937+21".into(),
            epoch: MjdEpoch::new(55555, 0.25),
            nchan: 2048,
            npol: 4,
            nsblk: 1024,
            tsamp: 40.96e-6,
            center_freq: 1200.0,
            bandwidth: -800.0,
            ..ObsHeader::default()
        }
    }

    #[test]
    fn test_validate_accepts_guppi_defaults() {
        assert!(guppi_header().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_8bit() {
        let h = ObsHeader {
            nbits: 4,
            ..guppi_header()
        };
        let err = h.validate().unwrap_err();
        assert!(err.to_string().contains("nbits=4"), "{err}");
    }

    #[test]
    fn test_validate_rejects_non_dividing_downsample() {
        let h = ObsHeader {
            ds_freq_fact: 3,
            ..guppi_header()
        };
        assert!(h.validate().is_err());
        let h = ObsHeader {
            ds_time_fact: 0,
            ..guppi_header()
        };
        assert!(h.validate().is_err());
    }

    #[test]
    fn test_reduced_shape() {
        let h = ObsHeader {
            only_i: true,
            ds_freq_fact: 4,
            ds_time_fact: 8,
            ..guppi_header()
        };
        let r = h.reduced();
        assert_eq!((r.npol, r.nchan, r.nsblk), (1, 512, 128));
        assert!((r.tsamp - 8.0 * 40.96e-6).abs() < 1e-15);
        assert!((r.block_duration() - h.block_duration()).abs() < 1e-12);
    }

    #[test]
    fn test_only_i_ignored_without_four_pols() {
        let h = ObsHeader {
            only_i: true,
            npol: 2,
            ..guppi_header()
        };
        assert_eq!(h.reduced().npol, 2);
    }

    #[test]
    fn test_folded_header() {
        let h = guppi_header().folded(256, Some("J1939+2134"));
        assert_eq!(h.obs_mode, ObsMode::Fold);
        assert_eq!(h.nbin, 256);
        assert_eq!(h.source, "J1939+2134");
        assert_eq!(guppi_header().folded(64, None).source, "B1937+21");
    }
}

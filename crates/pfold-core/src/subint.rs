use serde::{Deserialize, Serialize};

use crate::accumulator::FoldAccumulator;
use crate::schedule::FoldWindow;
use crate::time::MjdEpoch;

/// One normalised, timestamped fold output record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSubintegration {
    /// Profile laid out `[chan][pol][bin]`.
    pub profile: Vec<f32>,
    pub nchan: usize,
    pub npol: usize,
    pub nbin: usize,
    /// Mean block midpoint offset from the observation start, seconds.
    pub offs: f64,
    /// Span from the first contributing block start to the last block end.
    pub tsubint: f64,
    /// Absolute instant of `offs`.
    pub epoch: MjdEpoch,
    pub nblocks: usize,
}

impl OutputSubintegration {
    pub fn from_accumulator(acc: &FoldAccumulator, window: &FoldWindow, obs_epoch: MjdEpoch) -> Self {
        Self {
            profile: acc.normalized(),
            nchan: acc.nchan(),
            npol: acc.npol(),
            nbin: acc.nbin(),
            offs: window.offs,
            tsubint: window.tsubint,
            epoch: obs_epoch.add_seconds(window.offs),
            nblocks: window.nblocks,
        }
    }

    pub fn value(&self, chan: usize, pol: usize, bin: usize) -> f32 {
        self.profile[(chan * self.npol + pol) * self.nbin + bin]
    }

    /// Mean over channels of polarisation `pol`, one value per bin.
    pub fn band_profile(&self, pol: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.nbin];
        if self.nchan == 0 {
            return out;
        }
        for chan in 0..self.nchan {
            for (bin, v) in out.iter_mut().enumerate() {
                *v += self.value(chan, pol, bin);
            }
        }
        let n = self.nchan as f32;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }
}

//! Phase-resolved fold accumulator.
//!
//! Sums are kept bin-major (`[bin][pol][chan]`) so that folding one time
//! sample touches a single contiguous row. Normalisation transposes into
//! the persisted profile order (`[chan][pol][bin]`).

use crate::block::SampleEncoding;
use crate::error::{FoldError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct FoldAccumulator {
    nchan: usize,
    npol: usize,
    nbin: usize,
    sums: Vec<f64>,
    hits: Vec<u64>,
}

impl FoldAccumulator {
    pub fn new(nchan: usize, npol: usize, nbin: usize) -> Self {
        Self {
            nchan,
            npol,
            nbin,
            sums: vec![0.0; nbin * npol * nchan],
            hits: vec![0; nbin],
        }
    }

    pub fn nchan(&self) -> usize {
        self.nchan
    }

    pub fn npol(&self) -> usize {
        self.npol
    }

    pub fn nbin(&self) -> usize {
        self.nbin
    }

    /// Zero all sums and hit counts.
    pub fn clear(&mut self) {
        self.sums.fill(0.0);
        self.hits.fill(0);
    }

    #[inline]
    fn index(&self, channel: usize, pol: usize, bin: usize) -> usize {
        (bin * self.npol + pol) * self.nchan + channel
    }

    /// Add one value to a single cell. Does not touch hit counts; pair with
    /// [`record_hit`](Self::record_hit) once per time sample.
    #[inline]
    pub fn accumulate(&mut self, channel: usize, pol: usize, bin: usize, value: f64) {
        let i = self.index(channel, pol, bin);
        self.sums[i] += value;
    }

    #[inline]
    pub fn record_hit(&mut self, bin: usize) {
        self.hits[bin] += 1;
    }

    /// Fold one time sample (all polarisations and channels) into `bin`.
    #[inline]
    pub fn accumulate_spectrum(&mut self, bin: usize, spectrum: &[u8], encoding: SampleEncoding) {
        let n = self.npol * self.nchan;
        let row = &mut self.sums[bin * n..(bin + 1) * n];
        for (acc, &raw) in row.iter_mut().zip(spectrum) {
            *acc += encoding.decode(raw) as f64;
        }
        self.hits[bin] += 1;
    }

    pub fn sum(&self, channel: usize, pol: usize, bin: usize) -> f64 {
        self.sums[self.index(channel, pol, bin)]
    }

    pub fn hits(&self) -> &[u64] {
        &self.hits
    }

    pub fn total_hits(&self) -> u64 {
        self.hits.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.iter().all(|&h| h == 0)
    }

    fn check_dims(&self, other: &FoldAccumulator) -> Result<()> {
        if (self.nchan, self.npol, self.nbin) == (other.nchan, other.npol, other.nbin) {
            Ok(())
        } else {
            Err(FoldError::Shape {
                expected: format!("{}x{}x{}", self.nchan, self.npol, self.nbin),
                actual: format!("{}x{}x{}", other.nchan, other.npol, other.nbin),
            })
        }
    }

    /// Element-wise add `other` into `self`.
    pub fn merge(&mut self, other: &FoldAccumulator) -> Result<()> {
        self.check_dims(other)?;
        for (a, b) in self.sums.iter_mut().zip(&other.sums) {
            *a += b;
        }
        for (a, b) in self.hits.iter_mut().zip(&other.hits) {
            *a += b;
        }
        Ok(())
    }

    pub fn profile_len(&self) -> usize {
        self.sums.len()
    }

    /// Write `sums / max(hits, 1)` into `out` in `[chan][pol][bin]` order.
    pub fn normalize_into(&self, out: &mut [f32]) -> Result<()> {
        if out.len() != self.profile_len() {
            return Err(FoldError::Shape {
                expected: format!("{} profile values", self.profile_len()),
                actual: format!("{}", out.len()),
            });
        }
        for bin in 0..self.nbin {
            let norm = self.hits[bin].max(1) as f64;
            for pol in 0..self.npol {
                for chan in 0..self.nchan {
                    let v = self.sums[self.index(chan, pol, bin)] / norm;
                    out[(chan * self.npol + pol) * self.nbin + bin] = v as f32;
                }
            }
        }
        Ok(())
    }

    pub fn normalized(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.profile_len()];
        // Length matches by construction.
        let _ = self.normalize_into(&mut out);
        out
    }

    /// Bin-major sums, one `[pol][chan]` row per bin.
    pub(crate) fn sums_mut(&mut self) -> &mut [f64] {
        &mut self.sums
    }

    /// Adopt a reduced `(npol, nchan)` after in-place row compaction.
    pub(crate) fn reshape(&mut self, npol: usize, nchan: usize) {
        self.npol = npol;
        self.nchan = nchan;
        self.sums.truncate(self.nbin * npol * nchan);
    }

    /// Number of 64-bit words in the fixed payload encoding.
    pub fn encoded_words(nchan: usize, npol: usize, nbin: usize) -> usize {
        nbin + nbin * npol * nchan
    }

    /// Serialise as `[hits: nbin × u64][sums: nbin·npol·nchan × f64 bits]`.
    pub fn encode_into(&self, words: &mut [u64]) -> Result<()> {
        let need = Self::encoded_words(self.nchan, self.npol, self.nbin);
        if words.len() < need {
            return Err(FoldError::Shape {
                expected: format!("at least {need} payload words"),
                actual: format!("{}", words.len()),
            });
        }
        words[..self.nbin].copy_from_slice(&self.hits);
        words[self.nbin..need].copy_from_slice(bytemuck::cast_slice(&self.sums));
        Ok(())
    }

    pub fn decode(nchan: usize, npol: usize, nbin: usize, words: &[u64]) -> Result<Self> {
        let need = Self::encoded_words(nchan, npol, nbin);
        if words.len() < need {
            return Err(FoldError::Shape {
                expected: format!("at least {need} payload words"),
                actual: format!("{}", words.len()),
            });
        }
        Ok(Self {
            nchan,
            npol,
            nbin,
            hits: words[..nbin].to_vec(),
            sums: bytemuck::cast_slice::<u64, f64>(&words[nbin..need]).to_vec(),
        })
    }
}

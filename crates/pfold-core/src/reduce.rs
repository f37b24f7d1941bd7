//! In-place per-block reductions applied by the stream writer.
//!
//! Every transform works on a `[sample][pol][chan]` buffer, compacts
//! forward in place and returns the shape of the live prefix. A fold
//! accumulator's bin-major sums have the same layout with bins standing in
//! for samples, so the spectral steps apply to them unchanged.

use crate::accumulator::FoldAccumulator;
use crate::block::{BlockShape, SampleEncoding};
use crate::error::{FoldError, Result};
use crate::header::{ObsHeader, PolOrder};

/// Element type a reduction can read and write.
pub trait Sample: Copy {
    fn load(self, encoding: SampleEncoding) -> f64;
    fn store(value: f64, encoding: SampleEncoding) -> Self;
}

impl Sample for u8 {
    #[inline]
    fn load(self, encoding: SampleEncoding) -> f64 {
        encoding.decode(self) as f64
    }

    #[inline]
    fn store(value: f64, encoding: SampleEncoding) -> Self {
        encoding.encode(value)
    }
}

impl Sample for f64 {
    #[inline]
    fn load(self, _: SampleEncoding) -> f64 {
        self
    }

    #[inline]
    fn store(value: f64, _: SampleEncoding) -> Self {
        value
    }
}

/// Zero the first and last channel of every (sample, pol) row.
pub fn zero_edge_channels<T: Sample>(data: &mut [T], shape: BlockShape, encoding: SampleEncoding) {
    let zero = T::store(0.0, encoding);
    if shape.nchan == 0 {
        return;
    }
    for row in data[..shape.len()].chunks_exact_mut(shape.nchan) {
        row[0] = zero;
        row[shape.nchan - 1] = zero;
    }
}

/// Collapse four polarisation products to total intensity.
pub fn collapse_stokes_i<T: Sample>(
    data: &mut [T],
    shape: BlockShape,
    order: PolOrder,
    encoding: SampleEncoding,
) -> Result<BlockShape> {
    if shape.npol != 4 {
        return Err(FoldError::Shape {
            expected: "4 polarisations for Stokes I".into(),
            actual: format!("{}", shape.npol),
        });
    }
    let nchan = shape.nchan;
    for s in 0..shape.nsamp {
        let src = s * 4 * nchan;
        let dst = s * nchan;
        for c in 0..nchan {
            let i = match order {
                PolOrder::Iquv => data[src + c].load(encoding),
                PolOrder::AabbCrCi => {
                    0.5 * (data[src + c].load(encoding) + data[src + nchan + c].load(encoding))
                }
            };
            data[dst + c] = T::store(i, encoding);
        }
    }
    Ok(BlockShape::new(shape.nsamp, 1, nchan))
}

/// Average groups of `factor` adjacent channels.
pub fn downsample_freq<T: Sample>(
    data: &mut [T],
    shape: BlockShape,
    factor: usize,
    encoding: SampleEncoding,
) -> Result<BlockShape> {
    check_factor("frequency", factor, shape.nchan)?;
    let out_nchan = shape.nchan / factor;
    for row in 0..shape.nsamp * shape.npol {
        for g in 0..out_nchan {
            let base = row * shape.nchan + g * factor;
            let sum: f64 = data[base..base + factor].iter().map(|v| v.load(encoding)).sum();
            data[row * out_nchan + g] = T::store(sum / factor as f64, encoding);
        }
    }
    Ok(BlockShape::new(shape.nsamp, shape.npol, out_nchan))
}

/// Average groups of `factor` adjacent time samples.
pub fn downsample_time<T: Sample>(
    data: &mut [T],
    shape: BlockShape,
    factor: usize,
    encoding: SampleEncoding,
) -> Result<BlockShape> {
    check_factor("time", factor, shape.nsamp)?;
    let n = shape.spectrum_len();
    let out_nsamp = shape.nsamp / factor;
    for s in 0..out_nsamp {
        for k in 0..n {
            let sum: f64 = (0..factor)
                .map(|j| data[(s * factor + j) * n + k].load(encoding))
                .sum();
            data[s * n + k] = T::store(sum / factor as f64, encoding);
        }
    }
    Ok(BlockShape::new(out_nsamp, shape.npol, shape.nchan))
}

fn check_factor(axis: &str, factor: usize, len: usize) -> Result<()> {
    if factor == 0 || len % factor != 0 {
        return Err(FoldError::Setup(format!(
            "{axis} downsample factor {factor} does not divide {len}"
        )));
    }
    Ok(())
}

/// Configured reduction applied to each FILLED ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReductionStage {
    pub only_i: bool,
    pub pol_order: PolOrder,
    pub ds_freq: usize,
    pub ds_time: usize,
    pub encoding: SampleEncoding,
}

impl Default for ReductionStage {
    fn default() -> Self {
        Self {
            only_i: false,
            pol_order: PolOrder::Iquv,
            ds_freq: 1,
            ds_time: 1,
            encoding: SampleEncoding::Signed,
        }
    }
}

impl ReductionStage {
    pub fn from_header(header: &ObsHeader, encoding: SampleEncoding) -> Self {
        Self {
            only_i: header.only_i,
            pol_order: header.pol_order,
            ds_freq: header.ds_freq_fact.max(1),
            ds_time: header.ds_time_fact.max(1),
            encoding,
        }
    }

    /// Shape of a block after [`apply`](Self::apply).
    pub fn output_shape(&self, shape: BlockShape) -> BlockShape {
        let npol = if self.only_i && shape.npol == 4 { 1 } else { shape.npol };
        BlockShape::new(
            shape.nsamp / self.ds_time.max(1),
            npol,
            shape.nchan / self.ds_freq.max(1),
        )
    }

    /// Edge zeroing, Stokes I, frequency averaging. Leaves the time axis.
    pub fn apply_spectral<T: Sample>(&self, data: &mut [T], shape: BlockShape) -> Result<BlockShape> {
        if data.len() < shape.len() {
            return Err(FoldError::Shape {
                expected: format!("{} values for {shape:?}", shape.len()),
                actual: format!("{}", data.len()),
            });
        }
        zero_edge_channels(data, shape, self.encoding);
        let mut shape = shape;
        if self.only_i && shape.npol == 4 {
            shape = collapse_stokes_i(data, shape, self.pol_order, self.encoding)?;
        }
        if self.ds_freq > 1 {
            shape = downsample_freq(data, shape, self.ds_freq, self.encoding)?;
        }
        Ok(shape)
    }

    /// Full reduction of a search-mode block.
    pub fn apply<T: Sample>(&self, data: &mut [T], shape: BlockShape) -> Result<BlockShape> {
        let mut shape = self.apply_spectral(data, shape)?;
        if self.ds_time > 1 {
            shape = downsample_time(data, shape, self.ds_time, self.encoding)?;
        }
        Ok(shape)
    }

    /// Spectral reduction of a pre-folded accumulator.
    pub fn reduce_accumulator(&self, acc: &mut FoldAccumulator) -> Result<()> {
        let shape = BlockShape::new(acc.nbin(), acc.npol(), acc.nchan());
        let out = self.apply_spectral(acc.sums_mut(), shape)?;
        acc.reshape(out.npol, out.nchan);
        Ok(())
    }
}

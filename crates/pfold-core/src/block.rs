use serde::{Deserialize, Serialize};

use crate::error::{FoldError, Result};
use crate::time::MjdEpoch;

/// Dimensions of a block laid out `[sample][pol][chan]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockShape {
    pub nsamp: usize,
    pub npol: usize,
    pub nchan: usize,
}

impl BlockShape {
    pub fn new(nsamp: usize, npol: usize, nchan: usize) -> Self {
        Self { nsamp, npol, nchan }
    }

    /// Values per time sample (all polarisations and channels).
    pub fn spectrum_len(&self) -> usize {
        self.npol * self.nchan
    }

    pub fn len(&self) -> usize {
        self.nsamp * self.spectrum_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check_matches(&self, other: &BlockShape) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(FoldError::Shape {
                expected: format!("{self:?}"),
                actual: format!("{other:?}"),
            })
        }
    }
}

/// How raw 8-bit samples are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    #[default]
    Signed,
    Unsigned,
}

impl SampleEncoding {
    #[inline]
    pub fn decode(self, raw: u8) -> f32 {
        match self {
            SampleEncoding::Signed => raw as i8 as f32,
            SampleEncoding::Unsigned => raw as f32,
        }
    }

    /// Round to nearest and saturate into the 8-bit range.
    #[inline]
    pub fn encode(self, value: f64) -> u8 {
        let v = value.round();
        match self {
            SampleEncoding::Signed => v.clamp(i8::MIN as f64, i8::MAX as f64) as i8 as u8,
            SampleEncoding::Unsigned => v.clamp(0.0, u8::MAX as f64) as u8,
        }
    }
}

/// Placement of a block within its observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTiming {
    /// Offset of the block midpoint from the observation start, seconds.
    pub offs: f64,
    /// Block duration, seconds.
    pub tsubint: f64,
    /// Sample interval, seconds.
    pub tsamp: f64,
}

impl BlockTiming {
    pub fn start(&self) -> f64 {
        self.offs - 0.5 * self.tsubint
    }

    pub fn end(&self) -> f64 {
        self.offs + 0.5 * self.tsubint
    }
}

/// One fixed-size buffer of raw samples plus its timing.
///
/// Buffers are allocated once and recycled; `read` implementations fill
/// `data` in place.
#[derive(Clone, Debug)]
pub struct RawBlock {
    shape: BlockShape,
    data: Vec<u8>,
    pub timing: BlockTiming,
    /// Observation start the block offsets are measured from.
    pub obs_epoch: MjdEpoch,
}

impl RawBlock {
    pub fn zeroed(shape: BlockShape) -> Self {
        Self {
            shape,
            data: vec![0; shape.len()],
            timing: BlockTiming::default(),
            obs_epoch: MjdEpoch::default(),
        }
    }

    pub fn from_parts(shape: BlockShape, data: Vec<u8>, timing: BlockTiming, obs_epoch: MjdEpoch) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(FoldError::Shape {
                expected: format!("{} bytes for {shape:?}", shape.len()),
                actual: format!("{} bytes", data.len()),
            });
        }
        Ok(Self {
            shape,
            data,
            timing,
            obs_epoch,
        })
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace contents with `bytes` of the given shape, reusing capacity.
    pub fn fill_from(&mut self, shape: BlockShape, bytes: &[u8]) -> Result<()> {
        if bytes.len() != shape.len() {
            return Err(FoldError::Shape {
                expected: format!("{} bytes for {shape:?}", shape.len()),
                actual: format!("{} bytes", bytes.len()),
            });
        }
        self.shape = shape;
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// All polarisations and channels of time sample `isamp`.
    pub fn spectrum(&self, isamp: usize) -> &[u8] {
        let n = self.shape.spectrum_len();
        &self.data[isamp * n..(isamp + 1) * n]
    }

    /// Absolute start of the block.
    pub fn start_epoch(&self) -> MjdEpoch {
        self.obs_epoch.add_seconds(self.timing.start())
    }

    pub fn as_row(&self) -> SearchRow<'_> {
        SearchRow {
            shape: self.shape,
            timing: self.timing,
            data: &self.data,
        }
    }
}

/// Borrowed search-mode row handed to an archive sink.
#[derive(Clone, Copy, Debug)]
pub struct SearchRow<'a> {
    pub shape: BlockShape,
    pub timing: BlockTiming,
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_decode() {
        assert_eq!(SampleEncoding::Signed.decode(0xff), -1.0);
        assert_eq!(SampleEncoding::Signed.decode(0x7f), 127.0);
        assert_eq!(SampleEncoding::Unsigned.decode(0xff), 255.0);
    }

    #[test]
    fn test_encode_saturates() {
        assert_eq!(SampleEncoding::Signed.encode(-300.0) as i8, -128);
        assert_eq!(SampleEncoding::Signed.encode(2.6) as i8, 3);
        assert_eq!(SampleEncoding::Unsigned.encode(300.0), 255);
        assert_eq!(SampleEncoding::Unsigned.encode(-3.0), 0);
    }

    #[test]
    fn test_spectrum_slices_sample_major() {
        let shape = BlockShape::new(3, 2, 4);
        let data: Vec<u8> = (0..shape.len() as u8).collect();
        let block = RawBlock::from_parts(shape, data, BlockTiming::default(), MjdEpoch::default()).unwrap();
        assert_eq!(block.spectrum(1), &[8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_from_parts_rejects_wrong_length() {
        let shape = BlockShape::new(2, 1, 4);
        let err = RawBlock::from_parts(shape, vec![0; 7], BlockTiming::default(), MjdEpoch::default());
        assert!(matches!(err, Err(FoldError::Shape { .. })));
    }

    #[test]
    fn test_block_start_epoch() {
        let mut block = RawBlock::zeroed(BlockShape::new(1, 1, 1));
        block.obs_epoch = MjdEpoch::new(55000, 0.0);
        block.timing = BlockTiming {
            offs: 1.0,
            tsubint: 2.0,
            tsamp: 2.0,
        };
        assert_eq!(block.start_epoch(), MjdEpoch::new(55000, 0.0));
        assert_eq!(block.timing.end(), 2.0);
    }
}

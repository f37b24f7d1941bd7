//! Boundaries to the archive reader/writer collaborators.

use crate::block::{RawBlock, SearchRow};
use crate::error::Result;
use crate::header::ObsHeader;
use crate::polyco::PolycoRecord;
use crate::subint::OutputSubintegration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Block,
    EndOfStream,
}

/// Sequential single-reader source of raw blocks.
pub trait BlockSource {
    fn header(&self) -> &ObsHeader;

    /// Fill `block` in place with the next block of the observation.
    fn read_next_block(&mut self, block: &mut RawBlock) -> Result<ReadOutcome>;

    /// Current input file number and percent through it.
    fn progress(&self) -> (usize, f64);
}

/// Destination for folded subintegrations or reduced search rows.
pub trait ArchiveSink {
    fn write_ephemeris(&mut self, records: &[PolycoRecord]) -> Result<()>;
    fn write_subint(&mut self, subint: &OutputSubintegration) -> Result<()>;
    fn write_search_row(&mut self, row: &SearchRow<'_>) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

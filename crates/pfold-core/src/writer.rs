//! Ring-buffer consumer: reduce each filled slot and persist it.

use tracing::{debug, info, warn};

use crate::accumulator::FoldAccumulator;
use crate::block::{BlockTiming, SearchRow};
use crate::cancel::CancelToken;
use crate::error::{FoldError, Result};
use crate::header::ObsHeader;
use crate::io::ArchiveSink;
use crate::pipeline::{FoldPipeline, RunOutcome};
use crate::polyco::PhaseEphemeris;
use crate::reduce::ReductionStage;
use crate::ring::{BlockHeader, BlockMode, FilledSlot, RingConsumer};
use crate::schedule::FoldWindow;
use crate::status::{CURBLOCK, DISKSTAT, DROPPCT, NFILLED, StatusSink};
use crate::subint::OutputSubintegration;

#[derive(Clone, Debug, PartialEq)]
pub struct WriterSummary {
    pub outcome: RunOutcome,
    /// Slots persisted (after packet-0 gating).
    pub blocks: usize,
    pub rows: usize,
    /// Pre-folded slots written plus live-fold flushes.
    pub subints: usize,
    /// Slots released before the first packet-0 block.
    pub skipped: usize,
}

pub struct StreamWriter {
    header: ObsHeader,
    stage: ReductionStage,
    live_fold: Option<FoldPipeline>,
    /// Persisted up front when slots arrive pre-folded.
    ephemeris: Option<PhaseEphemeris>,
    got_packet_0: bool,
    elapsed: f64,
    blocks: usize,
    rows: usize,
    /// Pre-folded subints; live-fold flushes are counted by the pipeline.
    subints: usize,
    skipped: usize,
}

impl StreamWriter {
    /// `header` describes slots as the producer fills them; `stage` is
    /// applied to every slot before persisting.
    pub fn new(header: ObsHeader, stage: ReductionStage) -> Self {
        Self {
            header,
            stage,
            live_fold: None,
            ephemeris: None,
            got_packet_0: false,
            elapsed: 0.0,
            blocks: 0,
            rows: 0,
            subints: 0,
            skipped: 0,
        }
    }

    /// Fold reduced search blocks instead of writing them as rows. The
    /// pipeline must be built for the reduced block shape.
    pub fn with_live_fold(mut self, pipeline: FoldPipeline) -> Self {
        self.live_fold = Some(pipeline);
        self
    }

    /// Polycos the producer folds with. Written to the sink before the
    /// first slot so pre-folded archives carry their ephemeris.
    pub fn with_ephemeris(mut self, ephemeris: PhaseEphemeris) -> Self {
        self.ephemeris = Some(ephemeris);
        self
    }

    /// Consume slots until end of stream, scan completion, cancellation or
    /// a polyco gap in live-fold mode.
    pub fn run<K: ArchiveSink + ?Sized>(
        &mut self,
        consumer: &mut RingConsumer,
        sink: &mut K,
        status: &dyn StatusSink,
        cancel: &CancelToken,
    ) -> Result<WriterSummary> {
        status.set_text(DISKSTAT, "init");
        if let Some(pipeline) = &self.live_fold {
            sink.write_ephemeris(pipeline.ephemeris().records())?;
        } else if let Some(ephemeris) = &self.ephemeris {
            sink.write_ephemeris(ephemeris.records())?;
        }

        let outcome = loop {
            status.set_text(DISKSTAT, "waiting");
            let mut slot = match consumer.wait_filled(cancel) {
                Ok(Some(slot)) => slot,
                Ok(None) => break RunOutcome::EndOfStream,
                Err(FoldError::Cancelled) => break RunOutcome::Interrupted,
                Err(e) => return Err(e),
            };
            status.set_text(DISKSTAT, "writing");
            status.set_int(CURBLOCK, slot.index() as i64);
            status.set_int(NFILLED, slot.ring_filled() as i64);

            let hdr = slot.header();
            if hdr.packet_index == 0 {
                self.got_packet_0 = true;
            }
            if !self.got_packet_0 {
                debug!(packet = hdr.packet_index, "waiting for packet 0");
                self.skipped += 1;
                slot.set_free()?;
                continue;
            }

            status.set_int(DROPPCT, (hdr.drop_frac * 100.0).round() as i64);
            if hdr.drop_frac > 0.0 {
                warn!(
                    slot = slot.index(),
                    "block {:.0}% dropped",
                    hdr.drop_frac * 100.0
                );
            }

            let written = match hdr.mode()? {
                BlockMode::Search => self.write_search(&mut slot, &hdr, sink),
                BlockMode::Fold => self.write_fold(&slot, &hdr, sink),
            };
            slot.set_free()?;
            match written {
                Ok(()) => {}
                Err(FoldError::NoMatch(nm)) => {
                    warn!("{nm}");
                    break RunOutcome::NoMatch(nm);
                }
                Err(e) => return Err(e),
            }
            self.blocks += 1;
            self.elapsed += hdr.tsubint;

            if self.header.scanlen > 0.0 && self.elapsed > self.header.scanlen {
                info!(elapsed = self.elapsed, scanlen = self.header.scanlen, "scan complete");
                break RunOutcome::ScanComplete;
            }
            if cancel.is_cancelled() {
                break RunOutcome::Interrupted;
            }
        };

        let mut subints = self.subints;
        if let Some(pipeline) = &mut self.live_fold {
            pipeline.finish(sink)?;
            subints += pipeline.subints_written();
        }
        status.set_text(DISKSTAT, "exiting");
        sink.close()?;

        Ok(WriterSummary {
            outcome,
            blocks: self.blocks,
            rows: self.rows,
            subints,
            skipped: self.skipped,
        })
    }

    fn write_search<K: ArchiveSink + ?Sized>(
        &mut self,
        slot: &mut FilledSlot<'_>,
        hdr: &BlockHeader,
        sink: &mut K,
    ) -> Result<()> {
        let shape = hdr.shape();
        self.header.block_shape().check_matches(&shape)?;
        if hdr.payload_len as usize != shape.len() {
            return Err(FoldError::Shape {
                expected: format!("{} payload bytes", shape.len()),
                actual: format!("{}", hdr.payload_len),
            });
        }
        let bytes = slot
            .payload_bytes_mut()
            .get_mut(..shape.len())
            .ok_or_else(|| FoldError::Io("slot payload smaller than header claims".into()))?;
        let reduced = self.stage.apply(bytes, shape)?;
        let data = &bytes[..reduced.len()];
        let timing = BlockTiming {
            tsamp: hdr.tsamp * self.stage.ds_time.max(1) as f64,
            ..hdr.timing()
        };

        match &mut self.live_fold {
            Some(pipeline) => {
                let mut block = pipeline.take_block();
                block.fill_from(reduced, data)?;
                block.timing = timing;
                block.obs_epoch = self.header.epoch;
                pipeline.push(block, sink)?;
            }
            None => {
                sink.write_search_row(&SearchRow {
                    shape: reduced,
                    timing,
                    data,
                })?;
                self.rows += 1;
            }
        }
        Ok(())
    }

    fn write_fold<K: ArchiveSink + ?Sized>(
        &mut self,
        slot: &FilledSlot<'_>,
        hdr: &BlockHeader,
        sink: &mut K,
    ) -> Result<()> {
        let (nbin, npol, nchan) = (hdr.nsamp as usize, hdr.npol as usize, hdr.nchan as usize);
        let mut acc = FoldAccumulator::decode(nchan, npol, nbin, slot.payload())?;
        self.stage.reduce_accumulator(&mut acc)?;
        let window = FoldWindow {
            offs: hdr.offs,
            tsubint: hdr.tsubint,
            nblocks: 1,
        };
        let subint = OutputSubintegration::from_accumulator(&acc, &window, self.header.epoch);
        sink.write_subint(&subint)?;
        self.subints += 1;
        debug!(offs = hdr.offs, nbin, "wrote pre-folded subint");
        Ok(())
    }
}

//! File-mode fold loop: read, select polyco, dispatch, join, flush.

use tracing::{debug, info, warn};

use crate::block::{BlockShape, RawBlock, SampleEncoding};
use crate::cancel::CancelToken;
use crate::constants::{DEFAULT_NBIN, DEFAULT_NTHREAD, DEFAULT_TFOLD};
use crate::engine::{EngineConfig, FoldEngine};
use crate::error::{FoldError, NoMatch, Result};
use crate::io::{ArchiveSink, BlockSource, ReadOutcome};
use crate::polyco::PhaseEphemeris;
use crate::schedule::{FlushScheduler, FoldWindow, PartialWindow};
use crate::subint::OutputSubintegration;
use crate::time::MjdEpoch;

#[derive(Clone, Debug, PartialEq)]
pub struct FoldConfig {
    pub nbin: usize,
    /// Fold window length, seconds.
    pub tfold: f64,
    pub nthread: usize,
    pub encoding: SampleEncoding,
    pub partial: PartialWindow,
    /// Source name used for polyco selection; `None` accepts any record.
    pub source: Option<String>,
}

impl Default for FoldConfig {
    fn default() -> Self {
        Self {
            nbin: DEFAULT_NBIN,
            tfold: DEFAULT_TFOLD,
            nthread: DEFAULT_NTHREAD,
            encoding: SampleEncoding::Signed,
            partial: PartialWindow::Flush,
            source: None,
        }
    }
}

/// Why a fold or stream loop stopped without an error.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    EndOfStream,
    /// No polyco covered the next block; folding stopped there.
    NoMatch(NoMatch),
    Interrupted,
    /// Elapsed data exceeded the configured scan length.
    ScanComplete,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubintInfo {
    pub index: usize,
    pub offs: f64,
    pub tsubint: f64,
    pub nblocks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FoldEvent {
    Progress { filenum: usize, percent: f64 },
    SubintWritten(SubintInfo),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FoldSummary {
    pub outcome: RunOutcome,
    pub blocks: usize,
    pub subints: usize,
}

/// Engine, flush scheduler and ephemeris wired together.
pub struct FoldPipeline {
    engine: FoldEngine,
    scheduler: FlushScheduler,
    ephemeris: PhaseEphemeris,
    source: Option<String>,
    partial: PartialWindow,
    obs_epoch: MjdEpoch,
    last_polyco: Option<MjdEpoch>,
    subints: usize,
}

impl FoldPipeline {
    pub fn new(config: &FoldConfig, shape: BlockShape, obs_epoch: MjdEpoch, ephemeris: PhaseEphemeris) -> Result<Self> {
        let engine = FoldEngine::new(
            EngineConfig {
                nthread: config.nthread,
                nbin: config.nbin,
                encoding: config.encoding,
            },
            shape,
        )?;
        Ok(Self {
            engine,
            scheduler: FlushScheduler::new(config.tfold)?,
            ephemeris,
            source: config.source.clone(),
            partial: config.partial,
            obs_epoch,
            last_polyco: None,
            subints: 0,
        })
    }

    pub fn ephemeris(&self) -> &PhaseEphemeris {
        &self.ephemeris
    }

    pub fn subints_written(&self) -> usize {
        self.subints
    }

    pub fn take_block(&mut self) -> RawBlock {
        self.engine.take_block()
    }

    pub fn recycle(&mut self, block: RawBlock) {
        self.engine.recycle(block);
    }

    /// Fold one block. Returns the subint written if the block closed a
    /// fold window. A `FoldError::NoMatch` leaves earlier blocks in flight;
    /// call [`finish`](Self::finish) afterwards.
    pub fn push<K: ArchiveSink + ?Sized>(&mut self, block: RawBlock, sink: &mut K) -> Result<Option<SubintInfo>> {
        let at = block.start_epoch();
        let record = match self.ephemeris.select(self.source.as_deref(), at) {
            Ok(record) => record,
            Err(nm) => {
                self.engine.recycle(block);
                return Err(nm.into());
            }
        };
        if self.last_polyco != Some(record.epoch) {
            info!(source = %record.source, epoch = %record.epoch, "selected polyco");
            self.last_polyco = Some(record.epoch);
        }

        let crossed = self.scheduler.observe(&block.timing);
        debug!(offs = block.timing.offs, crossed, "dispatching block");
        self.engine.dispatch(block, record)?;

        if crossed || self.engine.is_saturated() {
            self.engine.join_and_merge()?;
        }
        if crossed {
            if let Some(window) = self.scheduler.take_window() {
                return self.emit(&window, sink).map(Some);
            }
        }
        Ok(None)
    }

    /// Join outstanding workers and apply the partial-window policy.
    pub fn finish<K: ArchiveSink + ?Sized>(&mut self, sink: &mut K) -> Result<Option<SubintInfo>> {
        self.engine.join_and_merge()?;
        let Some(window) = self.scheduler.take_partial() else {
            return Ok(None);
        };
        match self.partial {
            PartialWindow::Flush => self.emit(&window, sink).map(Some),
            PartialWindow::Discard => {
                info!(nblocks = window.nblocks, "discarding partial fold window");
                self.engine.clear_master();
                Ok(None)
            }
        }
    }

    fn emit<K: ArchiveSink + ?Sized>(&mut self, window: &FoldWindow, sink: &mut K) -> Result<SubintInfo> {
        let subint = OutputSubintegration::from_accumulator(self.engine.master(), window, self.obs_epoch);
        sink.write_subint(&subint)?;
        self.engine.clear_master();
        self.subints += 1;
        let info = SubintInfo {
            index: self.subints,
            offs: window.offs,
            tsubint: window.tsubint,
            nblocks: window.nblocks,
        };
        info!(
            index = info.index,
            offs = info.offs,
            tsubint = info.tsubint,
            nblocks = info.nblocks,
            "wrote subint"
        );
        Ok(info)
    }
}

/// Fold every block `source` yields into `sink`.
///
/// Stops cleanly on end of stream, cancellation or a polyco gap; any other
/// error aborts the run without closing the sink.
pub fn run_fold<S, K>(
    source: &mut S,
    sink: &mut K,
    pipeline: &mut FoldPipeline,
    cancel: &CancelToken,
    mut on_event: impl FnMut(FoldEvent),
) -> Result<FoldSummary>
where
    S: BlockSource + ?Sized,
    K: ArchiveSink + ?Sized,
{
    sink.write_ephemeris(pipeline.ephemeris().records())?;

    let mut blocks = 0;
    let outcome = loop {
        if cancel.is_cancelled() {
            info!("fold interrupted");
            break RunOutcome::Interrupted;
        }
        let mut block = pipeline.take_block();
        if source.read_next_block(&mut block)? == ReadOutcome::EndOfStream {
            pipeline.recycle(block);
            break RunOutcome::EndOfStream;
        }
        let (filenum, percent) = source.progress();
        on_event(FoldEvent::Progress { filenum, percent });

        match pipeline.push(block, sink) {
            Ok(Some(info)) => on_event(FoldEvent::SubintWritten(info)),
            Ok(None) => {}
            Err(FoldError::NoMatch(nm)) => {
                warn!("{nm}");
                break RunOutcome::NoMatch(nm);
            }
            Err(e) => return Err(e),
        }
        blocks += 1;
    };

    if let Some(info) = pipeline.finish(sink)? {
        on_event(FoldEvent::SubintWritten(info));
    }
    sink.close()?;
    Ok(FoldSummary {
        outcome,
        blocks,
        subints: pipeline.subints_written(),
    })
}

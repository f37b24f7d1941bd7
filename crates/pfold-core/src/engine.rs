//! Fork-join fold engine.
//!
//! A reusable rayon pool folds one raw block per task into a private
//! accumulator. Each task reports back through its own single-use channel;
//! the reader joins every outstanding task before merging into the master
//! accumulator, so merge order never depends on completion order.

use crossbeam::channel::{self, Receiver};
use tracing::{debug, error};

use crate::accumulator::FoldAccumulator;
use crate::block::{BlockShape, RawBlock, SampleEncoding};
use crate::error::{FoldError, Result};
use crate::polyco::{PolycoRecord, phase_bin};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub nthread: usize,
    pub nbin: usize,
    pub encoding: SampleEncoding,
}

/// Fold every sample of `block` into `acc` using `record`.
///
/// Sample `i` is timed at the block start plus `i * tsamp`.
pub fn fold_block(
    block: &RawBlock,
    record: &PolycoRecord,
    encoding: SampleEncoding,
    acc: &mut FoldAccumulator,
) -> Result<()> {
    let shape = block.shape();
    if (shape.npol, shape.nchan) != (acc.npol(), acc.nchan()) {
        return Err(FoldError::Shape {
            expected: format!("{} pols x {} chans", acc.npol(), acc.nchan()),
            actual: format!("{} pols x {} chans", shape.npol, shape.nchan),
        });
    }
    let nbin = acc.nbin();
    let base = record.minutes_from_epoch(block.start_epoch());
    let step = block.timing.tsamp / 60.0;
    for isamp in 0..shape.nsamp {
        let phase = record.predict(base + isamp as f64 * step).phase;
        acc.accumulate_spectrum(phase_bin(phase, nbin), block.spectrum(isamp), encoding);
    }
    Ok(())
}

type TaskOutput = Result<(RawBlock, FoldAccumulator)>;

pub struct FoldEngine {
    pool: rayon::ThreadPool,
    config: EngineConfig,
    shape: BlockShape,
    master: FoldAccumulator,
    pending: Vec<Receiver<TaskOutput>>,
    idle_blocks: Vec<RawBlock>,
    idle_accs: Vec<FoldAccumulator>,
}

impl FoldEngine {
    /// Size every buffer once from the fixed block shape.
    pub fn new(config: EngineConfig, shape: BlockShape) -> Result<Self> {
        if config.nthread == 0 || config.nbin == 0 {
            return Err(FoldError::Setup(format!(
                "need at least one worker and one bin (nthread={}, nbin={})",
                config.nthread, config.nbin
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nthread)
            .thread_name(|i| format!("pfold-worker-{i}"))
            .panic_handler(|_| error!("fold worker panicked"))
            .build()
            .map_err(|e| FoldError::Concurrency(format!("failed to start worker pool: {e}")))?;

        let fresh = || FoldAccumulator::new(shape.nchan, shape.npol, config.nbin);
        Ok(Self {
            pool,
            config,
            shape,
            master: fresh(),
            pending: Vec::with_capacity(config.nthread),
            idle_blocks: (0..config.nthread).map(|_| RawBlock::zeroed(shape)).collect(),
            idle_accs: (0..config.nthread).map(|_| fresh()).collect(),
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    /// A recycled block buffer, or a fresh one when all are in flight.
    pub fn take_block(&mut self) -> RawBlock {
        self.idle_blocks
            .pop()
            .unwrap_or_else(|| RawBlock::zeroed(self.shape))
    }

    pub fn recycle(&mut self, block: RawBlock) {
        self.idle_blocks.push(block);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_saturated(&self) -> bool {
        self.pending.len() >= self.config.nthread
    }

    /// Hand `block` to the pool. Never blocks.
    pub fn dispatch(&mut self, block: RawBlock, record: &PolycoRecord) -> Result<()> {
        if let Err(e) = self.shape.check_matches(&block.shape()) {
            self.recycle(block);
            return Err(e);
        }
        let mut acc = self
            .idle_accs
            .pop()
            .unwrap_or_else(|| FoldAccumulator::new(self.shape.nchan, self.shape.npol, self.config.nbin));
        let record = record.clone();
        let encoding = self.config.encoding;
        let (tx, rx) = channel::bounded(1);
        self.pool.spawn(move || {
            let out = fold_block(&block, &record, encoding, &mut acc).map(|()| (block, acc));
            // Receiver only disappears if the engine itself was dropped.
            let _ = tx.send(out);
        });
        self.pending.push(rx);
        Ok(())
    }

    /// Wait for every outstanding task, merge each result into the master
    /// accumulator and return buffers to the idle pools.
    ///
    /// All tasks are drained even when one fails; the first failure is
    /// returned.
    pub fn join_and_merge(&mut self) -> Result<()> {
        let mut first_err = None;
        let n = self.pending.len();
        for rx in self.pending.drain(..) {
            let outcome = rx.recv().unwrap_or_else(|_| {
                Err(FoldError::Concurrency("fold worker exited without a result".into()))
            });
            match outcome {
                Ok((block, mut acc)) => {
                    if let Err(e) = self.master.merge(&acc) {
                        first_err.get_or_insert(e);
                    }
                    acc.clear();
                    self.idle_accs.push(acc);
                    self.idle_blocks.push(block);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if n > 0 {
            debug!(tasks = n, hits = self.master.total_hits(), "merged worker accumulators");
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn master(&self) -> &FoldAccumulator {
        &self.master
    }

    pub fn clear_master(&mut self) {
        self.master.clear();
    }
}

impl Drop for FoldEngine {
    fn drop(&mut self) {
        // Let workers finish before the pool is torn down.
        for rx in self.pending.drain(..) {
            let _ = rx.recv();
        }
    }
}

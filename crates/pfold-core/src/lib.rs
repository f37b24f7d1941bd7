//! Real-time pulsar folding engine.
//!
//! Raw 8-bit power samples are assigned to rotational-phase bins predicted
//! by polynomial ephemerides (polycos), accumulated across a pool of fold
//! workers, merged, and flushed as normalised subintegrations on a fixed
//! time cadence. A slot ring buffer feeds a second writer stage that
//! reduces live blocks before persistence.
//!
//! No file I/O: archives and polyco files live behind the traits in [`io`].

pub mod accumulator;
pub mod block;
pub mod cancel;
pub mod constants;
pub mod engine;
pub mod error;
pub mod header;
pub mod io;
pub mod pipeline;
pub mod polyco;
pub mod reduce;
pub mod ring;
pub mod schedule;
pub mod status;
pub mod subint;
pub mod time;
pub mod writer;

pub use accumulator::FoldAccumulator;
pub use block::{BlockShape, BlockTiming, RawBlock, SampleEncoding, SearchRow};
pub use cancel::CancelToken;
pub use constants::{DEFAULT_NBIN, DEFAULT_NBLOCK, DEFAULT_NTHREAD, DEFAULT_TFOLD, WILDCARD_SOURCE};
pub use engine::{EngineConfig, FoldEngine, fold_block};
pub use error::{FoldError, NoMatch, Result};
pub use header::{ObsHeader, ObsMode, PolOrder};
pub use io::{ArchiveSink, BlockSource, ReadOutcome};
pub use pipeline::{FoldConfig, FoldEvent, FoldPipeline, FoldSummary, RunOutcome, SubintInfo, run_fold};
pub use polyco::{PhaseEphemeris, PhasePrediction, PolycoRecord, phase_bin};
pub use reduce::ReductionStage;
pub use ring::{BlockHeader, BlockMode, FilledSlot, FreeSlot, RingConsumer, RingProducer, ring};
pub use schedule::{FlushScheduler, FoldWindow, PartialWindow};
pub use status::{NullStatus, StatusBoard, StatusSink, StatusValue};
pub use subint::OutputSubintegration;
pub use time::{MjdEpoch, ParseMjdError};
pub use writer::{StreamWriter, WriterSummary};

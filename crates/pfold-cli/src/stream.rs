//! `pfold stream`: a producer thread replays a search archive into the
//! slot ring, standing in for the acquisition side, while the writer
//! stage reduces and persists each slot.

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use pfold_core::{
    BlockHeader, BlockSource, CancelToken, FoldAccumulator, FoldError, FoldPipeline, NoMatch, ObsHeader,
    PhaseEphemeris, RawBlock, ReadOutcome, ReductionStage, RingProducer, RunOutcome, SampleEncoding, StatusBoard,
    StreamWriter, fold_block, ring,
};
use pfold_store::{ArchiveWriter, RunConfig, SearchReader, archive_path};

use crate::FoldArgs;

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Input base name; files are read as {base}_NNNN.db
    input: PathBuf,

    /// Output base filename
    #[arg(short, long, default_value = "stream_out")]
    output: PathBuf,

    /// Ring buffer slots
    #[arg(long)]
    nblock: Option<usize>,

    /// Keep Stokes I only (4-pol data)
    #[arg(long)]
    only_i: bool,

    /// Frequency downsample factor
    #[arg(long)]
    ds_freq: Option<usize>,

    /// Time downsample factor
    #[arg(long)]
    ds_time: Option<usize>,

    /// Stop after this many seconds of data (0: until input ends)
    #[arg(long)]
    scanlen: Option<f64>,

    /// Fold reduced blocks in the writer instead of storing rows
    #[arg(long, conflicts_with = "producer_fold")]
    fold: bool,

    /// Producer folds each block; the writer stores pre-folded subints
    #[arg(long)]
    producer_fold: bool,

    /// Rows per output file in search mode (0: one file)
    #[arg(long, default_value_t = 0)]
    rows_per_file: usize,

    /// Replay the input until interrupted
    #[arg(long)]
    repeat: bool,

    /// Don't print the summary line
    #[arg(short, long)]
    quiet: bool,

    #[command(flatten)]
    fold_args: FoldArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamMode {
    Search,
    LiveFold,
    ProducerFold,
}

/// What the producer needs to fold blocks before handing them over.
struct ProducerFold {
    ephemeris: PhaseEphemeris,
    source: Option<String>,
    nbin: usize,
    encoding: SampleEncoding,
}

/// What the producer handed over, and why it stopped early if it did.
struct Produced {
    blocks: u64,
    no_match: Option<NoMatch>,
}

struct Feed {
    input: PathBuf,
    repeat: bool,
    cancel: CancelToken,
    fold: Option<ProducerFold>,
}

pub fn cmd_stream(args: &StreamArgs, config: &RunConfig, cancel: &CancelToken) -> Result<()> {
    let reader = SearchReader::open(&args.input, 1, None)
        .with_context(|| format!("failed to open input {}", archive_path(&args.input, 1).display()))?;

    let mut header = reader.header().clone();
    header.only_i = args.only_i || config.stream.only_i;
    header.ds_freq_fact = args.ds_freq.unwrap_or(config.stream.ds_freq);
    header.ds_time_fact = args.ds_time.unwrap_or(config.stream.ds_time);
    header.scanlen = args.scanlen.unwrap_or(config.stream.scanlen);
    header.validate()?;

    let mode = if args.fold {
        StreamMode::LiveFold
    } else if args.producer_fold {
        StreamMode::ProducerFold
    } else {
        StreamMode::Search
    };
    let fold = args.fold_args.fold_config(config, &header)?;
    let nblock = args.nblock.unwrap_or(config.stream.nblock);
    let stage = ReductionStage::from_header(&header, fold.encoding);
    let reduced = header.reduced();
    let folded = reduced.folded(fold.nbin, args.fold_args.source_override());

    let payload_bytes = match mode {
        StreamMode::ProducerFold => 8 * FoldAccumulator::encoded_words(header.nchan, header.npol, fold.nbin),
        StreamMode::Search | StreamMode::LiveFold => header.block_shape().len(),
    };
    let (producer, mut consumer) = ring(nblock, payload_bytes)?;
    tracing::info!(nblock, payload_bytes, ?mode, "stream ring ready");

    let mut writer = StreamWriter::new(header.clone(), stage);
    let mut feed = Feed {
        input: args.input.clone(),
        repeat: args.repeat,
        cancel: cancel.clone(),
        fold: None,
    };
    let mut sink = match mode {
        StreamMode::Search => ArchiveWriter::search(&args.output, &reduced, args.rows_per_file)?,
        StreamMode::LiveFold => {
            let ephemeris = args.fold_args.ephemeris(&header)?;
            let pipeline = FoldPipeline::new(&fold, reduced.block_shape(), header.epoch, ephemeris)?;
            writer = writer.with_live_fold(pipeline);
            ArchiveWriter::fold(&args.output, &folded)?
        }
        StreamMode::ProducerFold => {
            let ephemeris = args.fold_args.ephemeris(&header)?;
            writer = writer.with_ephemeris(ephemeris.clone());
            feed.fold = Some(ProducerFold {
                ephemeris,
                source: fold.source.clone(),
                nbin: fold.nbin,
                encoding: fold.encoding,
            });
            ArchiveWriter::fold(&args.output, &folded)?
        }
    };

    let handle = thread::Builder::new()
        .name("pfold-producer".into())
        .spawn(move || produce(reader, producer, feed))
        .context("failed to start producer thread")?;

    let status = StatusBoard::new();
    let result = writer.run(&mut consumer, &mut sink, &status, cancel);
    // Unblocks a producer waiting on a full ring.
    consumer.close();
    let produced = handle.join().map_err(|_| anyhow!("producer thread panicked"))?;

    let mut summary = result?;
    let produced = produced?;
    // The writer only sees the ring run dry when the producer stops on a gap.
    if summary.outcome == RunOutcome::EndOfStream
        && let Some(nm) = produced.no_match
    {
        summary.outcome = RunOutcome::NoMatch(nm);
    }
    tracing::debug!(status = ?status.snapshot(), "final writer status");

    if !args.quiet {
        println!(
            "streamed {} blocks: {} written, {} skipped, {} rows, {} subints ({}) -> {}",
            produced.blocks,
            summary.blocks,
            summary.skipped,
            summary.rows,
            summary.subints,
            crate::outcome_label(&summary.outcome),
            archive_path(&args.output, 1).display()
        );
    }
    Ok(())
}

/// Fill slots from the archive until it ends, the ring closes or the run
/// is cancelled, or the producer-side fold finds no covering polyco.
fn produce(mut reader: SearchReader, mut producer: RingProducer, feed: Feed) -> Result<Produced> {
    let header: ObsHeader = reader.header().clone();
    let mut block = RawBlock::zeroed(header.block_shape());
    let mut acc = feed
        .fold
        .as_ref()
        .map(|f| FoldAccumulator::new(header.nchan, header.npol, f.nbin));

    let mut packet: u64 = 0;
    let mut shift = 0.0;
    let mut cycle_end = 0.0;
    let mut no_match = None;
    loop {
        if feed.cancel.is_cancelled() {
            break;
        }
        if reader.read_next_block(&mut block)? == ReadOutcome::EndOfStream {
            if !feed.repeat || packet == 0 {
                break;
            }
            reader = SearchReader::open(&feed.input, 1, None)?;
            shift = cycle_end;
            tracing::debug!(shift, "replaying input");
            continue;
        }
        block.timing.offs += shift;
        cycle_end = block.timing.end();

        let record = match &feed.fold {
            Some(f) => match f.ephemeris.select(f.source.as_deref(), block.start_epoch()) {
                Ok(record) => Some(record),
                Err(nm) => {
                    tracing::warn!("producer: {nm}");
                    no_match = Some(nm);
                    break;
                }
            },
            None => None,
        };

        let mut slot = match producer.wait_free(&feed.cancel) {
            Ok(Some(slot)) => slot,
            Ok(None) | Err(FoldError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        };

        let hdr = match (&feed.fold, record, acc.as_mut()) {
            (Some(f), Some(record), Some(acc)) => {
                acc.clear();
                fold_block(&block, record, f.encoding, acc)?;
                acc.encode_into(slot.payload_mut())?;
                BlockHeader::fold(packet, block.timing, f.nbin, header.npol, header.nchan)
            }
            _ => {
                let data = block.data();
                let Some(dst) = slot.payload_bytes_mut().get_mut(..data.len()) else {
                    bail!("ring slot smaller than a block ({} bytes)", data.len());
                };
                dst.copy_from_slice(data);
                BlockHeader::search(packet, block.timing, block.shape(), 0.0)
            }
        };
        slot.set_filled(&hdr)?;
        packet += 1;
    }

    producer.close();
    tracing::info!(blocks = packet, "producer finished");
    Ok(Produced {
        blocks: packet,
        no_match,
    })
}

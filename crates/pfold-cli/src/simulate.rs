use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pfold_core::{
    ArchiveSink, BlockShape, BlockTiming, MjdEpoch, ObsHeader, ObsMode, PolycoRecord, SampleEncoding, SearchRow,
};
use pfold_store::{ArchiveWriter, archive_path, format_records};

/// Minutes covered by each polyco record written with `--polyco-out`.
const POLYCO_SPAN_MINUTES: f64 = 60.0;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Output base name; files are written as {base}_NNNN.db
    base: PathBuf,

    #[arg(long, default_value_t = 16)]
    nchan: usize,

    #[arg(long, default_value_t = 1)]
    npol: usize,

    /// Samples per block
    #[arg(long, default_value_t = 1024)]
    nsblk: usize,

    /// Sample interval, seconds
    #[arg(long, default_value_t = 1e-3)]
    tsamp: f64,

    /// Number of blocks
    #[arg(long, default_value_t = 16)]
    rows: usize,

    /// Blocks per file (0: one file)
    #[arg(long, default_value_t = 0)]
    rows_per_file: usize,

    /// Pulsar rotation frequency, Hz
    #[arg(long, default_value_t = 5.0)]
    freq: f64,

    /// Source name
    #[arg(long, default_value = "J0000+0000")]
    src: String,

    /// Observation start, MJD
    #[arg(long, default_value = "55000.0")]
    mjd: MjdEpoch,

    /// Pulse amplitude above the noise, counts
    #[arg(long, default_value_t = 40.0)]
    amp: f64,

    /// Fraction of the period the pulse is on
    #[arg(long, default_value_t = 0.05)]
    duty: f64,

    /// Write samples as unsigned bytes
    #[arg(long)]
    unsigned: bool,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Also write a polyco file matching the simulated pulsar
    #[arg(long)]
    polyco_out: Option<PathBuf>,
}

pub fn cmd_simulate(args: &SimulateArgs) -> Result<()> {
    if !(args.freq.is_finite() && args.freq > 0.0) {
        bail!("--freq must be positive");
    }
    let encoding = if args.unsigned {
        SampleEncoding::Unsigned
    } else {
        SampleEncoding::Signed
    };
    let header = ObsHeader {
        source: args.src.clone(),
        epoch: args.mjd,
        nchan: args.nchan,
        npol: args.npol,
        nsblk: args.nsblk,
        tsamp: args.tsamp,
        obs_mode: ObsMode::Search,
        center_freq: 1400.0,
        bandwidth: 100.0,
        ..ObsHeader::default()
    };
    header.validate()?;

    let baseline = match encoding {
        SampleEncoding::Signed => 0.0,
        SampleEncoding::Unsigned => 64.0,
    };
    let shape = BlockShape::new(args.nsblk, args.npol, args.nchan);
    let mut writer = ArchiveWriter::search(&args.base, &header, args.rows_per_file)
        .with_context(|| format!("failed to create {}", archive_path(&args.base, 1).display()))?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut data = vec![0u8; shape.len()];
    let tblock = header.block_duration();

    for k in 0..args.rows {
        let start = k as f64 * tblock;
        for (isamp, spectrum) in data.chunks_exact_mut(shape.spectrum_len()).enumerate() {
            let t = start + isamp as f64 * args.tsamp;
            let on = (args.freq * t).fract() < args.duty;
            for v in spectrum.iter_mut() {
                let mut x = baseline + rng.random_range(-4.0..4.0);
                if on {
                    x += args.amp;
                }
                *v = encoding.encode(x);
            }
        }
        let row = SearchRow {
            shape,
            timing: BlockTiming {
                offs: start + 0.5 * tblock,
                tsubint: tblock,
                tsamp: args.tsamp,
            },
            data: &data,
        };
        writer.write_search_row(&row)?;
    }
    writer.close()?;
    println!(
        "wrote {} rows ({:.3}s) to {} file(s) starting at {}",
        args.rows,
        args.rows as f64 * tblock,
        writer.filenum(),
        archive_path(&args.base, 1).display()
    );

    if let Some(path) = &args.polyco_out {
        let records = polycos_for(&header, args.freq, args.rows as f64 * tblock);
        std::fs::write(path, format_records(&records))
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {} polycos to {}", records.len(), path.display());
    }
    Ok(())
}

/// Constant-frequency records tiling `[start, start + duration]`.
fn polycos_for(header: &ObsHeader, freq: f64, duration: f64) -> Vec<PolycoRecord> {
    let count = (duration / 60.0 / POLYCO_SPAN_MINUTES).floor() as usize + 1;
    (0..count)
        .map(|i| {
            let secs = i as f64 * POLYCO_SPAN_MINUTES * 60.0;
            PolycoRecord {
                source: header.source.clone(),
                epoch: header.epoch.add_seconds(secs),
                ref_phase: (freq * secs).fract(),
                ref_freq: freq,
                obs_freq: header.center_freq,
                span_minutes: POLYCO_SPAN_MINUTES,
                site: "1".into(),
                coeffs: vec![0.0],
            }
        })
        .collect()
}

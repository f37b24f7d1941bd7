mod simulate;
mod stream;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pfold_core::{
    BlockSource, CancelToken, FoldConfig, FoldEvent, FoldPipeline, ObsHeader, PartialWindow, PhaseEphemeris,
    RunOutcome, SampleEncoding, run_fold,
};
use pfold_store::{Archive, ArchiveWriter, RunConfig, SearchReader, archive_path, parse_all};

const DEFAULT_POLYCO: &str = "polyco.dat";

#[derive(Parser)]
#[command(name = "pfold", about = "Fold pulsar search-mode data with polyco ephemerides")]
struct Cli {
    /// Run configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fold a search-mode archive series into subintegrations
    Fold(FoldCmd),

    /// Replay a search archive through the ring buffer and writer stage
    Stream(stream::StreamArgs),

    /// Write a synthetic pulsed search archive
    Simulate(simulate::SimulateArgs),

    /// Summarize an archive file
    Inspect {
        /// Archive file (.db)
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct FoldCmd {
    /// Input base name; files are read as {base}_NNNN.db
    input: PathBuf,

    /// Output base filename
    #[arg(short, long, default_value = "fold_out")]
    output: PathBuf,

    /// Starting input file number
    #[arg(short, long, default_value_t = 1)]
    initial: usize,

    /// Ending input file number (default: last file found)
    #[arg(short, long = "final")]
    final_filenum: Option<usize>,

    /// No progress indicator
    #[arg(short, long)]
    quiet: bool,

    #[command(flatten)]
    fold: FoldArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PartialArg {
    Flush,
    Discard,
}

impl From<PartialArg> for PartialWindow {
    fn from(p: PartialArg) -> Self {
        match p {
            PartialArg::Flush => PartialWindow::Flush,
            PartialArg::Discard => PartialWindow::Discard,
        }
    }
}

/// Options shared by every command that folds.
#[derive(Args, Clone, Debug)]
pub(crate) struct FoldArgs {
    /// Number of profile bins
    #[arg(short = 'b', long)]
    nbin: Option<usize>,

    /// Folded subintegration time, seconds
    #[arg(short = 't', long)]
    tsub: Option<f64>,

    /// Number of fold worker threads
    #[arg(short = 'j', long)]
    nthread: Option<usize>,

    /// Override source name from file
    #[arg(short = 's', long)]
    src: Option<String>,

    /// Polyco file to use [default: polyco.dat]
    #[arg(short = 'p', long, conflicts_with = "foldfreq")]
    polyco: Option<PathBuf>,

    /// Fold at a constant frequency, Hz
    #[arg(short = 'F', long)]
    foldfreq: Option<f64>,

    /// Raw data is unsigned
    #[arg(short = 'u', long)]
    unsigned: bool,

    /// What to do with a trailing partial fold window
    #[arg(long, value_enum)]
    partial: Option<PartialArg>,
}

impl FoldArgs {
    /// Configuration file values overridden by command-line flags.
    pub(crate) fn fold_config(&self, config: &RunConfig, header: &ObsHeader) -> Result<FoldConfig> {
        let source = self.src.clone().unwrap_or_else(|| header.source.clone());
        let mut fold = config.to_fold_config(Some(source));
        if let Some(nbin) = self.nbin {
            fold.nbin = nbin;
        }
        if let Some(tsub) = self.tsub {
            fold.tfold = tsub;
        }
        if let Some(nthread) = self.nthread {
            fold.nthread = nthread;
        }
        if self.unsigned {
            fold.encoding = SampleEncoding::Unsigned;
        }
        if let Some(partial) = self.partial {
            fold.partial = partial.into();
        }
        if fold.nbin == 0 {
            bail!("nbin must be at least 1");
        }
        Ok(fold)
    }

    pub(crate) fn ephemeris(&self, header: &ObsHeader) -> Result<PhaseEphemeris> {
        if let Some(freq) = self.foldfreq {
            tracing::info!(freq, "folding at constant frequency");
            return Ok(PhaseEphemeris::constant(freq, header.epoch, header.center_freq)?);
        }
        let path = self.polyco.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_POLYCO));
        let records =
            parse_all(&path).with_context(|| format!("couldn't read polycos from {}", path.display()))?;
        tracing::info!(path = %path.display(), records = records.len(), "loaded polycos");
        Ok(PhaseEphemeris::new(records)?)
    }

    pub(crate) fn source_override(&self) -> Option<&str> {
        self.src.as_deref()
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = RunConfig::load_or_default(cli.config.as_deref()).context("failed to load run config")?;

    match cli.command {
        Commands::Fold(cmd) => run_cancellable(move |cancel| cmd_fold(&cmd, &config, &cancel)).await,
        Commands::Stream(args) => run_cancellable(move |cancel| stream::cmd_stream(&args, &config, &cancel)).await,
        Commands::Simulate(args) => simulate::cmd_simulate(&args),
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Run `work` on a blocking thread; SIGINT/SIGTERM cancel it cooperatively.
async fn run_cancellable<F>(work: F) -> Result<()>
where
    F: FnOnce(CancelToken) -> Result<()> + Send + 'static,
{
    let cancel = CancelToken::new();
    watch_signals(cancel.clone())?;
    tokio::task::spawn_blocking(move || work(cancel))
        .await
        .context("fold thread panicked")?
}

#[cfg(unix)]
fn watch_signals(cancel: CancelToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    // Registered before any work starts so an early signal is not fatal.
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("SIGINT received, stopping"),
            _ = terminate.recv() => tracing::info!("SIGTERM received, stopping"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn watch_signals(cancel: CancelToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            cancel.cancel();
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_fold(cmd: &FoldCmd, config: &RunConfig, cancel: &CancelToken) -> Result<()> {
    let mut reader = SearchReader::open(&cmd.input, cmd.initial, cmd.final_filenum)
        .with_context(|| format!("failed to open input {}", archive_path(&cmd.input, cmd.initial).display()))?;
    let header = reader.header().clone();
    header.validate()?;

    let fold = cmd.fold.fold_config(config, &header)?;
    let ephemeris = cmd.fold.ephemeris(&header)?;
    let mut pipeline = FoldPipeline::new(&fold, header.block_shape(), header.epoch, ephemeris)?;

    let out_header = header.folded(fold.nbin, cmd.fold.source_override());
    let mut writer = ArchiveWriter::fold(&cmd.output, &out_header)
        .with_context(|| format!("failed to create output {}", archive_path(&cmd.output, 1).display()))?;

    let quiet = cmd.quiet;
    let summary = run_fold(&mut reader, &mut writer, &mut pipeline, cancel, |event| {
        if quiet {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = match event {
            FoldEvent::Progress { filenum, percent } => write!(out, "\rFile {filenum} {percent:5.1}%"),
            FoldEvent::SubintWritten(_) => writeln!(out, "\rWrote subint   "),
        };
        let _ = out.flush();
    })?;

    if !quiet {
        println!();
    }
    println!(
        "folded {} blocks into {} subints ({}) -> {}",
        summary.blocks,
        summary.subints,
        outcome_label(&summary.outcome),
        archive_path(&cmd.output, 1).display()
    );
    Ok(())
}

pub(crate) fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::EndOfStream => "end of input",
        RunOutcome::NoMatch(_) => "no matching polycos",
        RunOutcome::Interrupted => "interrupted",
        RunOutcome::ScanComplete => "scan complete",
    }
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let archive = Archive::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let s = archive.summary().context("failed to summarize archive")?;
    let mode = match s.mode {
        pfold_core::ObsMode::Search => "SEARCH",
        pfold_core::ObsMode::Fold => "PSR",
    };

    println!("mode:       {mode}");
    println!("source:     {}", s.source);
    println!("start:      MJD {}", s.start);
    println!("shape:      nchan={} npol={} nsblk={} nbin={}", s.nchan, s.npol, s.nsblk, s.nbin);
    println!("rows:       {}", s.search_rows);
    println!("subints:    {}", s.subints);
    println!("polycos:    {}", s.polycos);
    match (s.first_offs, s.last_offs) {
        (Some(first), Some(last)) => println!("offs:       {first:.3}s .. {last:.3}s"),
        _ => println!("offs:       -"),
    }
    println!("complete:   {}", if s.complete { "yes" } else { "no" });
    if let Some(run_id) = s.run_id {
        println!("run_id:     {run_id}");
    }
    Ok(())
}

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use pfold_core::{
    ArchiveSink, BlockSource, BlockTiming, FoldError, MjdEpoch, ObsHeader, ObsMode, OutputSubintegration,
    PolycoRecord, RawBlock, ReadOutcome, SearchRow,
};

use crate::error::{Result, StoreError};
use crate::schema;

const KEY_HEADER: &str = "obs_header";
const KEY_MODE: &str = "obs_mode";
const KEY_RUN_ID: &str = "run_id";
const KEY_COMPLETE: &str = "complete";

/// Path of file number `filenum` of the archive series rooted at `base`.
pub fn archive_path(base: &Path, filenum: usize) -> PathBuf {
    PathBuf::from(format!("{}_{filenum:04}.db", base.display()))
}

/// One SQLite archive file.
pub struct Archive {
    conn: Connection,
    header: ObsHeader,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveSummary {
    pub mode: ObsMode,
    pub source: String,
    pub start: MjdEpoch,
    pub nchan: usize,
    pub npol: usize,
    pub nsblk: usize,
    pub nbin: usize,
    pub search_rows: usize,
    pub subints: usize,
    pub polycos: usize,
    pub first_offs: Option<f64>,
    pub last_offs: Option<f64>,
    pub run_id: Option<String>,
    pub complete: bool,
}

impl Archive {
    /// Create a new archive file. Refuses to overwrite an existing one.
    pub fn create(path: &Path, header: &ObsHeader) -> Result<Self> {
        if path.exists() {
            return Err(StoreError::InvalidData(format!(
                "refusing to overwrite existing archive {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let archive = Self::init(conn, header)?;
        debug!(path = %path.display(), mode = ?header.obs_mode, "created archive");
        Ok(archive)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archive {} not found", path.display()),
            )));
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        let json: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [KEY_HEADER], |row| row.get(0))
            .optional()?;
        let json = json.ok_or_else(|| StoreError::InvalidData(format!("{} has no observation header", path.display())))?;
        let header: ObsHeader = serde_json::from_str(&json)?;
        Ok(Self { conn, header })
    }

    pub fn open_in_memory(header: &ObsHeader) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, header)
    }

    fn init(conn: Connection, header: &ObsHeader) -> Result<Self> {
        schema::initialize(&conn)?;
        let archive = Self {
            conn,
            header: header.clone(),
        };
        archive.set_metadata(KEY_HEADER, &serde_json::to_string(header)?)?;
        archive.set_metadata(KEY_MODE, mode_name(header.obs_mode))?;
        archive.set_metadata(KEY_RUN_ID, &Uuid::new_v4().to_string())?;
        Ok(archive)
    }

    pub fn header(&self) -> &ObsHeader {
        &self.header
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn mark_complete(&self) -> Result<()> {
        self.set_metadata(KEY_COMPLETE, "true")
    }

    // --- Search rows ---

    pub fn append_search_row(&self, row: &SearchRow<'_>) -> Result<()> {
        self.header.block_shape().check_matches(&row.shape).map_err(shape_error)?;
        self.conn.execute(
            "INSERT INTO search_rows (offs, tsubint, data) VALUES (?1, ?2, ?3)",
            params![row.timing.offs, row.timing.tsubint, row.data],
        )?;
        Ok(())
    }

    /// Read 1-based row `rownum` into `block`. Returns false past the last row.
    pub fn read_search_row(&self, rownum: usize, block: &mut RawBlock) -> Result<bool> {
        let row: Option<(f64, f64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT offs, tsubint, data FROM search_rows WHERE rownum = ?1",
                [rownum as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((offs, tsubint, data)) = row else {
            return Ok(false);
        };
        block.fill_from(self.header.block_shape(), &data).map_err(shape_error)?;
        block.timing = BlockTiming {
            offs,
            tsubint,
            tsamp: self.header.tsamp,
        };
        block.obs_epoch = self.header.epoch;
        Ok(true)
    }

    pub fn search_row_count(&self) -> Result<usize> {
        self.count("search_rows")
    }

    // --- Subintegrations ---

    pub fn append_subint(&self, subint: &OutputSubintegration) -> Result<()> {
        let data: Vec<u8> = subint.profile.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.conn.execute(
            "INSERT INTO subints (offs, tsubint, epoch_imjd, epoch_fmjd, nchan, npol, nbin, nblocks, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                subint.offs,
                subint.tsubint,
                subint.epoch.imjd,
                subint.epoch.fmjd,
                subint.nchan as i64,
                subint.npol as i64,
                subint.nbin as i64,
                subint.nblocks as i64,
                data,
            ],
        )?;
        Ok(())
    }

    pub fn read_subints(&self) -> Result<Vec<OutputSubintegration>> {
        let mut stmt = self.conn.prepare(
            "SELECT offs, tsubint, epoch_imjd, epoch_fmjd, nchan, npol, nbin, nblocks, data
             FROM subints ORDER BY rownum",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Vec<u8>>(8)?,
            ))
        })?;

        let mut subints = Vec::new();
        for row in rows {
            let (offs, tsubint, imjd, fmjd, nchan, npol, nbin, nblocks, data) = row?;
            let (nchan, npol, nbin) = (nchan as usize, npol as usize, nbin as usize);
            if data.len() != 4 * nchan * npol * nbin {
                return Err(StoreError::InvalidData(format!(
                    "subint blob holds {} bytes, expected {}",
                    data.len(),
                    4 * nchan * npol * nbin
                )));
            }
            let profile = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            subints.push(OutputSubintegration {
                profile,
                nchan,
                npol,
                nbin,
                offs,
                tsubint,
                epoch: MjdEpoch { imjd, fmjd },
                nblocks: nblocks as usize,
            });
        }
        Ok(subints)
    }

    pub fn subint_count(&self) -> Result<usize> {
        self.count("subints")
    }

    // --- Polycos ---

    pub fn write_polycos(&self, records: &[PolycoRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM polycos", [])?;
        for (idx, pc) in records.iter().enumerate() {
            let span = pc.span_minutes.is_finite().then_some(pc.span_minutes);
            tx.execute(
                "INSERT INTO polycos (idx, source, imjd, fmjd, rphase, f0, span_minutes, rfreq, site, coeffs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    idx as i64,
                    pc.source,
                    pc.epoch.imjd,
                    pc.epoch.fmjd,
                    pc.ref_phase,
                    pc.ref_freq,
                    span,
                    pc.obs_freq,
                    pc.site,
                    serde_json::to_string(&pc.coeffs)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_polycos(&self) -> Result<Vec<PolycoRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, imjd, fmjd, rphase, f0, span_minutes, rfreq, site, coeffs
             FROM polycos ORDER BY idx",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (source, imjd, fmjd, ref_phase, ref_freq, span, obs_freq, site, coeffs) = row?;
            records.push(PolycoRecord {
                source,
                epoch: MjdEpoch { imjd, fmjd },
                ref_phase,
                ref_freq,
                obs_freq,
                span_minutes: span.unwrap_or(f64::INFINITY),
                site,
                coeffs: serde_json::from_str(&coeffs)?,
            });
        }
        Ok(records)
    }

    pub fn summary(&self) -> Result<ArchiveSummary> {
        let table = match self.header.obs_mode {
            ObsMode::Search => "search_rows",
            ObsMode::Fold => "subints",
        };
        let (first_offs, last_offs): (Option<f64>, Option<f64>) = self.conn.query_row(
            &format!("SELECT MIN(offs), MAX(offs) FROM {table}"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ArchiveSummary {
            mode: self.header.obs_mode,
            source: self.header.source.clone(),
            start: self.header.epoch,
            nchan: self.header.nchan,
            npol: self.header.npol,
            nsblk: self.header.nsblk,
            nbin: self.header.nbin,
            search_rows: self.search_row_count()?,
            subints: self.subint_count()?,
            polycos: self.count("polycos")?,
            first_offs,
            last_offs,
            run_id: self.get_metadata(KEY_RUN_ID)?,
            complete: self.get_metadata(KEY_COMPLETE)?.as_deref() == Some("true"),
        })
    }

    fn count(&self, table: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn mode_name(mode: ObsMode) -> &'static str {
    match mode {
        ObsMode::Search => "SEARCH",
        ObsMode::Fold => "PSR",
    }
}

fn shape_error(e: FoldError) -> StoreError {
    StoreError::InvalidData(e.to_string())
}

// --- Reading ---

/// Sequential reader over a numbered series of search archives.
pub struct SearchReader {
    base: PathBuf,
    header: ObsHeader,
    filenum: usize,
    final_filenum: Option<usize>,
    archive: Archive,
    rows_in_file: usize,
    next_row: usize,
}

impl SearchReader {
    /// Open file `initial` of the series. Reading stops after
    /// `final_filenum` or at the first missing file.
    pub fn open(base: &Path, initial: usize, final_filenum: Option<usize>) -> Result<Self> {
        let archive = Archive::open(&archive_path(base, initial))?;
        let header = archive.header().clone();
        if header.obs_mode != ObsMode::Search {
            return Err(StoreError::InvalidData(format!(
                "{} is not a search-mode archive",
                archive_path(base, initial).display()
            )));
        }
        let rows_in_file = archive.search_row_count()?;
        info!(base = %base.display(), filenum = initial, rows = rows_in_file, "opened search archive");
        Ok(Self {
            base: base.to_path_buf(),
            header,
            filenum: initial,
            final_filenum,
            archive,
            rows_in_file,
            next_row: 0,
        })
    }

    pub fn filenum(&self) -> usize {
        self.filenum
    }

    /// Move to the next file. Returns false when the series ends.
    fn advance_file(&mut self) -> Result<bool> {
        let next = self.filenum + 1;
        if self.final_filenum.is_some_and(|last| next > last) {
            return Ok(false);
        }
        let path = archive_path(&self.base, next);
        if !path.exists() {
            debug!(path = %path.display(), "no further input file");
            return Ok(false);
        }
        self.archive = Archive::open(&path)?;
        self.rows_in_file = self.archive.search_row_count()?;
        self.filenum = next;
        self.next_row = 0;
        info!(filenum = next, rows = self.rows_in_file, "opened next input file");
        Ok(true)
    }

    fn read_row(&mut self, block: &mut RawBlock) -> Result<ReadOutcome> {
        loop {
            if self.next_row < self.rows_in_file {
                self.next_row += 1;
                if self.archive.read_search_row(self.next_row, block)? {
                    return Ok(ReadOutcome::Block);
                }
                return Err(StoreError::InvalidData(format!(
                    "row {} missing from file {}",
                    self.next_row, self.filenum
                )));
            }
            if !self.advance_file()? {
                return Ok(ReadOutcome::EndOfStream);
            }
        }
    }
}

impl BlockSource for SearchReader {
    fn header(&self) -> &ObsHeader {
        &self.header
    }

    fn read_next_block(&mut self, block: &mut RawBlock) -> pfold_core::Result<ReadOutcome> {
        Ok(self.read_row(block)?)
    }

    fn progress(&self) -> (usize, f64) {
        let pct = if self.rows_in_file == 0 {
            100.0
        } else {
            100.0 * self.next_row as f64 / self.rows_in_file as f64
        };
        (self.filenum, pct)
    }
}

// --- Writing ---

/// Archive sink for either reduced search rows or folded subints.
pub struct ArchiveWriter {
    base: PathBuf,
    header: ObsHeader,
    rows_per_file: usize,
    filenum: usize,
    current: Option<Archive>,
    rows_in_file: usize,
}

impl ArchiveWriter {
    /// Search-mode output split into files of `rows_per_file` rows
    /// (0 keeps everything in one file).
    pub fn search(base: &Path, header: &ObsHeader, rows_per_file: usize) -> Result<Self> {
        if header.obs_mode != ObsMode::Search {
            return Err(StoreError::InvalidData("search writer needs a SEARCH header".into()));
        }
        Self::create(base, header, rows_per_file)
    }

    /// Fold-mode output written to `{base}_0001.db`.
    pub fn fold(base: &Path, header: &ObsHeader) -> Result<Self> {
        if header.obs_mode != ObsMode::Fold {
            return Err(StoreError::InvalidData("fold writer needs a PSR header".into()));
        }
        Self::create(base, header, 0)
    }

    fn create(base: &Path, header: &ObsHeader, rows_per_file: usize) -> Result<Self> {
        let path = archive_path(base, 1);
        let archive = Archive::create(&path, header)?;
        info!(path = %path.display(), "writing archive");
        Ok(Self {
            base: base.to_path_buf(),
            header: header.clone(),
            rows_per_file,
            filenum: 1,
            current: Some(archive),
            rows_in_file: 0,
        })
    }

    pub fn filenum(&self) -> usize {
        self.filenum
    }

    fn current(&self) -> Result<&Archive> {
        self.current
            .as_ref()
            .ok_or_else(|| StoreError::InvalidData("archive writer already closed".into()))
    }

    fn roll_over(&mut self) -> Result<()> {
        if let Some(done) = self.current.take() {
            done.mark_complete()?;
        }
        self.filenum += 1;
        let path = archive_path(&self.base, self.filenum);
        self.current = Some(Archive::create(&path, &self.header)?);
        self.rows_in_file = 0;
        info!(path = %path.display(), "started next output file");
        Ok(())
    }

    fn expect_mode(&self, mode: ObsMode, what: &str) -> Result<()> {
        if self.header.obs_mode != mode {
            return Err(StoreError::InvalidData(format!(
                "cannot write {what} to a {} archive",
                mode_name(self.header.obs_mode)
            )));
        }
        Ok(())
    }

    fn append_row(&mut self, row: &SearchRow<'_>) -> Result<()> {
        self.expect_mode(ObsMode::Search, "search rows")?;
        if self.rows_per_file > 0 && self.rows_in_file == self.rows_per_file {
            self.roll_over()?;
        }
        self.current()?.append_search_row(row)?;
        self.rows_in_file += 1;
        Ok(())
    }

    fn append_subint(&mut self, subint: &OutputSubintegration) -> Result<()> {
        self.expect_mode(ObsMode::Fold, "subints")?;
        if (subint.nchan, subint.npol, subint.nbin) != (self.header.nchan, self.header.npol, self.header.nbin) {
            return Err(StoreError::InvalidData(format!(
                "subint shape (nchan={}, npol={}, nbin={}) does not match archive (nchan={}, npol={}, nbin={})",
                subint.nchan, subint.npol, subint.nbin, self.header.nchan, self.header.npol, self.header.nbin
            )));
        }
        self.current()?.append_subint(subint)
    }
}

impl ArchiveSink for ArchiveWriter {
    fn write_ephemeris(&mut self, records: &[PolycoRecord]) -> pfold_core::Result<()> {
        self.expect_mode(ObsMode::Fold, "polycos")?;
        self.current()?.write_polycos(records)?;
        debug!(records = records.len(), "stored polyco table");
        Ok(())
    }

    fn write_subint(&mut self, subint: &OutputSubintegration) -> pfold_core::Result<()> {
        Ok(self.append_subint(subint)?)
    }

    fn write_search_row(&mut self, row: &SearchRow<'_>) -> pfold_core::Result<()> {
        Ok(self.append_row(row)?)
    }

    fn close(&mut self) -> pfold_core::Result<()> {
        if let Some(archive) = self.current.take() {
            archive.mark_complete()?;
            info!(filenum = self.filenum, "closed archive");
        }
        Ok(())
    }
}

use std::path::Path;

use approx::assert_relative_eq;
use pfold_core::{
    ArchiveSink, BlockShape, BlockSource, BlockTiming, CancelToken, FoldConfig, FoldPipeline, MjdEpoch, ObsHeader,
    PhaseEphemeris, RawBlock, ReadOutcome, RunOutcome, SearchRow, run_fold,
};
use pfold_store::{Archive, ArchiveWriter, SearchReader, archive_path, parse_str};

const NSBLK: usize = 100;
const NCHAN: usize = 2;
const TSAMP: f64 = 0.01;

fn header() -> ObsHeader {
    ObsHeader {
        source: "B0329+54".into(),
        epoch: MjdEpoch::new(55000, 0.0),
        nchan: NCHAN,
        npol: 1,
        nsblk: NSBLK,
        tsamp: TSAMP,
        center_freq: 1400.0,
        bandwidth: 100.0,
        ..ObsHeader::default()
    }
}

/// One-second blocks with a 10-sample pulse at the start of each second.
fn write_series(base: &Path, rows: usize, rows_per_file: usize) {
    let mut writer = ArchiveWriter::search(base, &header(), rows_per_file).unwrap();
    let mut data = vec![0u8; NSBLK * NCHAN];
    for (i, v) in data.iter_mut().enumerate() {
        if i / NCHAN < 10 {
            *v = 10;
        }
    }
    for k in 0..rows {
        let row = SearchRow {
            shape: BlockShape::new(NSBLK, 1, NCHAN),
            timing: BlockTiming {
                offs: k as f64 + 0.5,
                tsubint: 1.0,
                tsamp: TSAMP,
            },
            data: &data,
        };
        writer.write_search_row(&row).unwrap();
    }
    writer.close().unwrap();
}

fn count_blocks(reader: &mut SearchReader) -> usize {
    let mut block = RawBlock::zeroed(reader.header().block_shape());
    let mut n = 0;
    while reader.read_next_block(&mut block).unwrap() == ReadOutcome::Block {
        n += 1;
    }
    n
}

#[test]
fn search_series_rolls_over_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("obs");
    write_series(&base, 10, 4);

    for filenum in 1..=3 {
        assert!(archive_path(&base, filenum).exists(), "file {filenum} missing");
    }
    assert!(!archive_path(&base, 4).exists());

    let last = Archive::open(&archive_path(&base, 3)).unwrap().summary().unwrap();
    assert_eq!(last.search_rows, 2);
    assert!(last.complete);
    assert_relative_eq!(last.first_offs.unwrap(), 8.5);

    let mut reader = SearchReader::open(&base, 1, None).unwrap();
    assert_eq!(count_blocks(&mut reader), 10);
    assert_eq!(reader.progress(), (3, 100.0));
}

#[test]
fn reader_honours_file_range() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("obs");
    write_series(&base, 10, 4);

    let mut reader = SearchReader::open(&base, 2, Some(2)).unwrap();
    assert_eq!(count_blocks(&mut reader), 4);

    let mut reader = SearchReader::open(&base, 2, None).unwrap();
    let mut block = RawBlock::zeroed(reader.header().block_shape());
    reader.read_next_block(&mut block).unwrap();
    assert_relative_eq!(block.timing.offs, 4.5);
}

#[test]
fn missing_first_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SearchReader::open(&dir.path().join("nothing"), 1, None).is_err());
}

#[test]
fn fold_archive_series_into_subints() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("obs");
    write_series(&base, 10, 4);

    let mut reader = SearchReader::open(&base, 1, None).unwrap();
    let hdr = reader.header().clone();
    let config = FoldConfig {
        nbin: 10,
        tfold: 5.0,
        nthread: 2,
        ..FoldConfig::default()
    };
    let ephemeris = PhaseEphemeris::constant(1.0, hdr.epoch, hdr.center_freq).unwrap();
    let mut pipeline = FoldPipeline::new(&config, hdr.block_shape(), hdr.epoch, ephemeris).unwrap();

    let out_base = dir.path().join("folded");
    let mut writer = ArchiveWriter::fold(&out_base, &hdr.folded(config.nbin, None)).unwrap();
    let summary = run_fold(&mut reader, &mut writer, &mut pipeline, &CancelToken::new(), |_| {}).unwrap();

    assert_eq!(summary.outcome, RunOutcome::EndOfStream);
    assert_eq!(summary.blocks, 10);
    assert_eq!(summary.subints, 2);

    let archive = Archive::open(&archive_path(&out_base, 1)).unwrap();
    let subints = archive.read_subints().unwrap();
    assert_eq!(subints.len(), 2);
    assert_relative_eq!(subints[0].offs, 2.5);
    assert_relative_eq!(subints[0].tsubint, 5.0);
    assert_eq!(subints[1].nblocks, 5);

    let profile = subints[0].band_profile(0);
    assert!(profile[0] > 8.0, "on-pulse bin {:?}", profile);
    assert!(profile[5] < 1.0, "off-pulse bin {:?}", profile);

    let polycos = archive.read_polycos().unwrap();
    assert_eq!(polycos.len(), 1);
    assert!(polycos[0].span_minutes.is_infinite());
}

#[test]
fn fold_with_parsed_polycos_stops_at_gap() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("obs");
    write_series(&base, 10, 0);

    // Covers the first 5.4 s of the observation only.
    let records = parse_str(
        "\
0329+54 01-Jan-09 000000.00 55000.00000000000 26.8 -0.3 -6.1
0.0 1.000000000000 1 0.09 1 1400.000
 0.00000000000000000D+00
",
    )
    .unwrap();
    let mut reader = SearchReader::open(&base, 1, None).unwrap();
    let hdr = reader.header().clone();
    let config = FoldConfig {
        nbin: 10,
        tfold: 4.0,
        nthread: 2,
        source: Some(hdr.source.clone()),
        ..FoldConfig::default()
    };
    let mut pipeline =
        FoldPipeline::new(&config, hdr.block_shape(), hdr.epoch, PhaseEphemeris::new(records).unwrap()).unwrap();
    let out_base = dir.path().join("folded");
    let mut writer = ArchiveWriter::fold(&out_base, &hdr.folded(config.nbin, None)).unwrap();
    let summary = run_fold(&mut reader, &mut writer, &mut pipeline, &CancelToken::new(), |_| {}).unwrap();

    assert!(matches!(summary.outcome, RunOutcome::NoMatch(_)));
    assert_eq!(summary.blocks, 6);
    let archive = Archive::open(&archive_path(&out_base, 1)).unwrap();
    let nblocks: Vec<usize> = archive.read_subints().unwrap().iter().map(|s| s.nblocks).collect();
    assert_eq!(nblocks, vec![4, 2]);
}

//! CLI command integration tests.
//! Each test works inside its own temp directory.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pfold_cmd(dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("pfold").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

fn db(dir: &TempDir, base: &str) -> PathBuf {
    dir.path().join(format!("{base}_0001.db"))
}

/// 16 blocks of 1.024 s, 16 channels, 5 Hz pulsar, plus matching polycos.
fn simulate(dir: &TempDir, extra: &[&str]) {
    pfold_cmd(dir)
        .args(["simulate", "sim", "--polyco-out", "polyco.dat"])
        .args(extra)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote 16 rows"));
}

fn inspect(dir: &TempDir, path: &Path) -> String {
    let output = pfold_cmd(dir).arg("inspect").arg(path).output().unwrap();
    assert!(output.status.success(), "inspect failed: {output:?}");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn simulate_then_inspect() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);
    assert!(dir.path().join("polyco.dat").exists());

    let out = inspect(&dir, &db(&dir, "sim"));
    assert!(out.contains("mode:       SEARCH"), "{out}");
    assert!(out.contains("source:     J0000+0000"), "{out}");
    assert!(out.contains("rows:       16"), "{out}");
    assert!(out.contains("complete:   yes"), "{out}");
}

#[test]
fn fold_with_default_polyco_file() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);

    pfold_cmd(&dir)
        .args(["fold", "sim", "-t", "4", "-b", "32", "-j", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote subint"))
        .stdout(predicate::str::contains("File 1"))
        .stdout(predicate::str::contains("folded 16 blocks into 4 subints (end of input)"));

    let out = inspect(&dir, &db(&dir, "fold_out"));
    assert!(out.contains("mode:       PSR"), "{out}");
    assert!(out.contains("nbin=32"), "{out}");
    assert!(out.contains("subints:    4"), "{out}");
    assert!(out.contains("polycos:    1"), "{out}");
}

#[test]
fn fold_at_constant_frequency_quietly() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);

    pfold_cmd(&dir)
        .args(["fold", "sim", "-o", "constant", "-F", "5.0", "-t", "6", "-q", "--partial", "discard"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote subint").not())
        .stdout(predicate::str::contains("into 2 subints"));

    let out = inspect(&dir, &db(&dir, "constant"));
    assert!(out.contains("subints:    2"), "{out}");
}

#[test]
fn polyco_and_foldfreq_conflict() {
    let dir = TempDir::new().unwrap();
    pfold_cmd(&dir)
        .args(["fold", "sim", "-p", "polyco.dat", "-F", "5.0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn fold_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    pfold_cmd(&dir)
        .args(["fold", "nothing", "-F", "1.0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open input"));
}

#[test]
fn fold_missing_polyco_file_fails() {
    let dir = TempDir::new().unwrap();
    pfold_cmd(&dir).args(["simulate", "sim"]).assert().success();
    pfold_cmd(&dir)
        .args(["fold", "sim"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("couldn't read polycos"));
}

#[test]
fn fold_honours_file_range_and_config() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &["--rows-per-file", "4"]);
    std::fs::write(dir.path().join("pfold.toml"), "[fold]\nnbin = 16\ntsub = 2.0\n").unwrap();

    pfold_cmd(&dir)
        .args(["--config", "pfold.toml", "fold", "sim", "-i", "2", "-f", "3", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::contains("folded 8 blocks into 4 subints"));

    let out = inspect(&dir, &db(&dir, "fold_out"));
    assert!(out.contains("nbin=16"), "{out}");
}

#[test]
fn fold_rejects_zero_bins() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);
    pfold_cmd(&dir)
        .args(["fold", "sim", "-F", "5.0", "-b", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nbin must be at least 1"));
}

#[test]
fn stream_reduces_rows() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &["--npol", "4"]);

    pfold_cmd(&dir)
        .args(["stream", "sim", "-o", "reduced", "--only-i", "--ds-freq", "4", "--ds-time", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("16 written"))
        .stdout(predicate::str::contains("16 rows"));

    let out = inspect(&dir, &db(&dir, "reduced"));
    assert!(out.contains("nchan=4 npol=1 nsblk=512"), "{out}");
    assert!(out.contains("rows:       16"), "{out}");
}

#[test]
fn stream_live_fold() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);

    pfold_cmd(&dir)
        .args(["stream", "sim", "-o", "live", "--fold", "-t", "4", "-b", "32"])
        .assert()
        .success()
        .stdout(predicate::str::contains("4 subints"));

    let out = inspect(&dir, &db(&dir, "live"));
    assert!(out.contains("subints:    4"), "{out}");
    assert!(out.contains("polycos:    1"), "{out}");
}

#[test]
fn stream_producer_fold_writes_one_subint_per_block() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);

    pfold_cmd(&dir)
        .args(["stream", "sim", "-o", "prefolded", "--producer-fold", "-F", "5.0", "-b", "64", "--ds-freq", "2"])
        .assert()
        .success();

    let out = inspect(&dir, &db(&dir, "prefolded"));
    assert!(out.contains("subints:    16"), "{out}");
    assert!(out.contains("nchan=8"), "{out}");
    assert!(out.contains("nbin=64"), "{out}");
    assert!(out.contains("polycos:    1"), "{out}");
}

#[test]
fn stream_producer_fold_reports_polyco_gap() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);
    // Covers 5.4 s: the blocks starting at 0 through 5.12 s.
    std::fs::write(
        dir.path().join("short.dat"),
        "\
J0000+0000 01-Jan-09 000000.00 55000.00000000000 0.0 0.0 -6.0
0.0 5.000000000000 1 0.09 1 1400.000
 0.00000000000000000D+00
",
    )
    .unwrap();

    pfold_cmd(&dir)
        .args(["stream", "sim", "-o", "gap", "--producer-fold", "-p", "short.dat", "-b", "32"])
        .assert()
        .success()
        .stdout(predicate::str::contains("6 subints (no matching polycos)"));

    let out = inspect(&dir, &db(&dir, "gap"));
    assert!(out.contains("subints:    6"), "{out}");
    assert!(out.contains("polycos:    1"), "{out}");
}

#[test]
fn stream_repeat_stops_at_scan_length() {
    let dir = TempDir::new().unwrap();
    simulate(&dir, &[]);

    pfold_cmd(&dir)
        .args(["stream", "sim", "-o", "scan", "--repeat", "--scanlen", "40"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("(scan complete)"));

    // 1.024 s blocks: the 40th block takes elapsed time past 40 s.
    let out = inspect(&dir, &db(&dir, "scan"));
    assert!(out.contains("rows:       40"), "{out}");
}

#[test]
fn inspect_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    pfold_cmd(&dir)
        .args(["inspect", "missing_0001.db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open"));
}

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS search_rows (
            rownum  INTEGER PRIMARY KEY,
            offs    REAL NOT NULL,
            tsubint REAL NOT NULL,
            data    BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subints (
            rownum     INTEGER PRIMARY KEY,
            offs       REAL NOT NULL,
            tsubint    REAL NOT NULL,
            epoch_imjd INTEGER NOT NULL,
            epoch_fmjd REAL NOT NULL,
            nchan      INTEGER NOT NULL,
            npol       INTEGER NOT NULL,
            nbin       INTEGER NOT NULL,
            nblocks    INTEGER NOT NULL DEFAULT 0,
            data       BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS polycos (
            idx          INTEGER PRIMARY KEY,
            source       TEXT NOT NULL,
            imjd         INTEGER NOT NULL,
            fmjd         REAL NOT NULL,
            rphase       REAL NOT NULL,
            f0           REAL NOT NULL,
            span_minutes REAL,
            rfreq        REAL NOT NULL,
            site         TEXT NOT NULL DEFAULT '',
            coeffs       TEXT NOT NULL
        );
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

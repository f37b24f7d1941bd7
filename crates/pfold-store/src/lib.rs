//! Persistence and file formats for pfold: SQLite search/fold archives,
//! TEMPO polyco files and the TOML run configuration.

pub mod archive;
pub mod config;
pub mod error;
pub mod polyco_file;
pub mod schema;

pub use archive::{Archive, ArchiveSummary, ArchiveWriter, SearchReader, archive_path};
pub use config::{FoldSection, RunConfig, StreamSection};
pub use error::{Result, StoreError};
pub use polyco_file::{format_records, parse_all, parse_str};

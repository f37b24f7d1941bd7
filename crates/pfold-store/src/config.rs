use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pfold_core::{
    DEFAULT_NBIN, DEFAULT_NBLOCK, DEFAULT_NTHREAD, DEFAULT_TFOLD, FoldConfig, PartialWindow, SampleEncoding,
};

use crate::error::{Result, StoreError};

/// Contents of `pfold.toml`. Every key is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub fold: FoldSection,
    pub stream: StreamSection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldSection {
    pub nbin: usize,
    /// Fold window, seconds.
    pub tsub: f64,
    pub nthread: usize,
    /// Interpret raw samples as signed bytes.
    pub signed: bool,
    pub partial_window: PartialWindow,
}

impl Default for FoldSection {
    fn default() -> Self {
        Self {
            nbin: DEFAULT_NBIN,
            tsub: DEFAULT_TFOLD,
            nthread: DEFAULT_NTHREAD,
            signed: true,
            partial_window: PartialWindow::Flush,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub nblock: usize,
    pub only_i: bool,
    pub ds_freq: usize,
    pub ds_time: usize,
    /// Seconds; 0 streams until the producer stops.
    pub scanlen: f64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            nblock: DEFAULT_NBLOCK,
            only_i: false,
            ds_freq: 1,
            ds_time: 1,
            scanlen: 0.0,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        debug!(path = %path.display(), "loaded run config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.fold.nbin == 0 {
            return Err(StoreError::Config("fold.nbin must be at least 1".into()));
        }
        if !(self.fold.tsub.is_finite() && self.fold.tsub > 0.0) {
            return Err(StoreError::Config(format!("fold.tsub must be positive, got {}", self.fold.tsub)));
        }
        if self.stream.nblock == 0 {
            return Err(StoreError::Config("stream.nblock must be at least 1".into()));
        }
        if self.stream.ds_freq == 0 || self.stream.ds_time == 0 {
            return Err(StoreError::Config("downsample factors must be at least 1".into()));
        }
        Ok(())
    }

    pub fn encoding(&self) -> SampleEncoding {
        if self.fold.signed {
            SampleEncoding::Signed
        } else {
            SampleEncoding::Unsigned
        }
    }

    pub fn to_fold_config(&self, source: Option<String>) -> FoldConfig {
        FoldConfig {
            nbin: self.fold.nbin,
            tfold: self.fold.tsub,
            nthread: self.fold.nthread,
            encoding: self.encoding(),
            partial: self.fold.partial_window,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = RunConfig::from_toml("").unwrap();
        assert_eq!(config, RunConfig::default());
        let fold = config.to_fold_config(None);
        assert_eq!(fold, FoldConfig::default());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = RunConfig::from_toml(
            r#"
            [fold]
            nbin = 64
            signed = false
            partial_window = "discard"

            [stream]
            only_i = true
            ds_freq = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.fold.nbin, 64);
        assert_eq!(config.fold.tsub, DEFAULT_TFOLD);
        assert_eq!(config.encoding(), SampleEncoding::Unsigned);
        assert_eq!(config.fold.partial_window, PartialWindow::Discard);
        assert!(config.stream.only_i);
        assert_eq!(config.stream.ds_freq, 4);
        assert_eq!(config.stream.nblock, DEFAULT_NBLOCK);
    }

    #[test]
    fn test_rejects_zero_nbin() {
        let err = RunConfig::from_toml("[fold]\nnbin = 0\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_partial_policy() {
        assert!(RunConfig::from_toml("[fold]\npartial_window = \"keep\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[fold]\ntsub = 10.0\nnthread = 2").unwrap();
        let config = RunConfig::load(file.path()).unwrap();
        assert_eq!(config.fold.tsub, 10.0);
        assert_eq!(config.fold.nthread, 2);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RunConfig::load_or_default(Some(Path::new("/nonexistent/pfold.toml"))).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}

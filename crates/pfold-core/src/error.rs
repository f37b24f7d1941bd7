use crate::time::MjdEpoch;

/// No polyco record covers the requested source and instant.
///
/// Not fatal to the process: the fold loop stops accepting blocks, drains
/// its workers and exits normally.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no matching polycos (src={psr}, MJD {epoch})")]
pub struct NoMatch {
    pub psr: String,
    pub epoch: MjdEpoch,
}

#[derive(Debug, thiserror::Error)]
pub enum FoldError {
    /// Unusable input or configuration detected before folding starts.
    #[error("setup error: {0}")]
    Setup(String),

    #[error(transparent)]
    NoMatch(#[from] NoMatch),

    /// Mid-run read or write failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Worker dispatch/join failure or a broken slot hand-off.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for FoldError {
    fn from(e: std::io::Error) -> Self {
        FoldError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FoldError>;

/// Seconds in one (UTC) day.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Minutes in one day; polyco time arguments are expressed in minutes.
pub const MINUTES_PER_DAY: f64 = 1_440.0;

/// Default number of phase bins per profile.
pub const DEFAULT_NBIN: usize = 256;

/// Default fold-window (subintegration) length in seconds.
pub const DEFAULT_TFOLD: f64 = 60.0;

/// Default number of concurrent fold workers.
pub const DEFAULT_NTHREAD: usize = 4;

/// Default number of slots in the stream ring buffer.
pub const DEFAULT_NBLOCK: usize = 8;

/// Slack applied when comparing block edges against a flush deadline,
/// absorbing rounding in accumulated block offsets.
pub const DEADLINE_EPSILON_SECS: f64 = 1e-6;

/// Only 8-bit samples are supported by the fold kernel.
pub const SUPPORTED_NBITS: u32 = 8;

/// Source name that matches any requested source.
pub const WILDCARD_SOURCE: &str = "*";

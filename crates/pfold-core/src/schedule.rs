//! Time-driven flush policy.
//!
//! Independent of worker dispatch: a window closes when a block's end
//! reaches the deadline, however many blocks that took.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::BlockTiming;
use crate::constants::DEADLINE_EPSILON_SECS;
use crate::error::{FoldError, Result};

/// What to do with a partially accumulated window at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialWindow {
    #[default]
    Flush,
    Discard,
}

/// Timestamps of one closed fold window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FoldWindow {
    /// Mean of the contributing block midpoints.
    pub offs: f64,
    /// Last block end minus first block start.
    pub tsubint: f64,
    pub nblocks: usize,
}

#[derive(Clone, Debug)]
pub struct FlushScheduler {
    tfold: f64,
    deadline: Option<f64>,
    first_start: f64,
    last_end: f64,
    offs_sum: f64,
    count: usize,
}

impl FlushScheduler {
    pub fn new(tfold: f64) -> Result<Self> {
        if !(tfold.is_finite() && tfold > 0.0) {
            return Err(FoldError::Setup(format!(
                "fold window must be positive, got {tfold} s"
            )));
        }
        Ok(Self {
            tfold,
            deadline: None,
            first_start: 0.0,
            last_end: 0.0,
            offs_sum: 0.0,
            count: 0,
        })
    }

    pub fn tfold(&self) -> f64 {
        self.tfold
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    pub fn pending_blocks(&self) -> usize {
        self.count
    }

    /// Record a block that is about to be folded. Returns `true` when it
    /// closes the current window; the caller folds it, joins, then calls
    /// [`take_window`](Self::take_window).
    pub fn observe(&mut self, timing: &BlockTiming) -> bool {
        if self.count == 0 {
            self.first_start = timing.start();
        }
        let deadline = *self.deadline.get_or_insert(timing.start() + self.tfold);
        self.offs_sum += timing.offs;
        self.last_end = timing.end();
        self.count += 1;
        self.last_end >= deadline - DEADLINE_EPSILON_SECS
    }

    /// Close the window after a boundary crossing and arm the next
    /// deadline one fold length past the crossing block's end.
    pub fn take_window(&mut self) -> Option<FoldWindow> {
        let window = self.window()?;
        self.deadline = Some(self.last_end + self.tfold);
        self.reset_running();
        debug!(
            offs = window.offs,
            tsubint = window.tsubint,
            nblocks = window.nblocks,
            "fold window closed"
        );
        Some(window)
    }

    /// Close whatever has accumulated at shutdown, if anything.
    pub fn take_partial(&mut self) -> Option<FoldWindow> {
        let window = self.window()?;
        self.reset_running();
        Some(window)
    }

    fn window(&self) -> Option<FoldWindow> {
        (self.count > 0).then(|| FoldWindow {
            offs: self.offs_sum / self.count as f64,
            tsubint: self.last_end - self.first_start,
            nblocks: self.count,
        })
    }

    fn reset_running(&mut self) {
        self.offs_sum = 0.0;
        self.count = 0;
    }
}

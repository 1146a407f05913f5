use crate::model::*;

/// Gate on how close to its start a confirmed booking may still be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationPolicy {
    cutoff_ms: Ms,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self { cutoff_ms: 2 * HOUR_MS }
    }
}

impl CancellationPolicy {
    pub fn new(cutoff_ms: Ms) -> Self {
        Self { cutoff_ms }
    }

    pub fn cutoff_ms(&self) -> Ms {
        self.cutoff_ms
    }

    /// True iff `start - now` is strictly greater than the cutoff.
    pub fn allows(&self, start: Ms, now: Ms) -> bool {
        start - now > self.cutoff_ms
    }
}

//! Minimal reset-cause latch.
//!
//! `spec.md` scopes the full ECSM block (bridge ACL, scrub, decimator,
//! FMPLL lock detect) out as trivial register plumbing, but SWT's
//! second-timeout-forces-reset rule (§4.4) still needs somewhere to record
//! *why* a reset happened. This is that one cell, not a peripheral.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Cause of the most recent reset, matching the original's `SWTSR`-style
/// cause enumeration at the granularity this fabric actually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    PowerOn,
    External,
    Swt,
    Software,
}

impl ResetCause {
    fn to_tag(self) -> u8 {
        match self {
            ResetCause::PowerOn => 0,
            ResetCause::External => 1,
            ResetCause::Swt => 2,
            ResetCause::Software => 3,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => ResetCause::PowerOn,
            1 => ResetCause::External,
            2 => ResetCause::Swt,
            _ => ResetCause::Software,
        }
    }
}

/// Shared, thread-safe reset-cause cell. SWT writes through this on an
/// unconditional-reset timeout; `fabric-sim` reads it on boot to decide
/// whether to report a watchdog-induced restart.
#[derive(Debug, Clone)]
pub struct EcsmResetCause {
    cause: Arc<AtomicU8>,
}

impl Default for EcsmResetCause {
    fn default() -> Self {
        EcsmResetCause {
            cause: Arc::new(AtomicU8::new(ResetCause::PowerOn.to_tag())),
        }
    }
}

impl EcsmResetCause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cause: ResetCause) {
        self.cause.store(cause.to_tag(), Ordering::SeqCst);
    }

    pub fn get(&self) -> ResetCause {
        ResetCause::from_tag(self.cause.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_power_on() {
        let cell = EcsmResetCause::new();
        assert_eq!(cell.get(), ResetCause::PowerOn);
    }

    #[test]
    fn records_swt_cause() {
        let cell = EcsmResetCause::new();
        cell.set(ResetCause::Swt);
        assert_eq!(cell.get(), ResetCause::Swt);
    }
}

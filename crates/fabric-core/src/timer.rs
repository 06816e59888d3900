//! Shared monotonic timer register, used by SWT's watchdog countdown and
//! FlexCAN's bit-clock timer (`spec.md` §4.4/§4.6, "holds a TimerRegister").
//!
//! Grounded on `original_source/cm2350/ppc_peripherals.py`'s
//! `EmulationTime`/timer-callback convention: a counter paced against the
//! CPU's scaled `system_time()` rather than a real OS clock, with an
//! optional threshold callback invoked by the caller's own tick loop instead
//! of on a dedicated thread.

/// A free-running or down-counting register paced by a configured
/// frequency against the CPU's scaled clock. Counting direction and
/// wraparound/threshold behavior are caller-selected; this type only owns
/// the arithmetic of "how many ticks have elapsed since I last sampled the
/// clock."
#[derive(Debug, Clone, Copy)]
pub struct TimerRegister {
    frequency_hz: f64,
    running: bool,
    /// `system_time()` at which `value` was last accurate.
    anchor_time: f64,
    anchor_value: u32,
    /// Counter wraps (or saturates, for a down-counter hitting zero) at
    /// this modulus.
    modulus: u64,
    down_counting: bool,
}

impl TimerRegister {
    pub fn new(frequency_hz: f64, down_counting: bool, modulus: u64) -> Self {
        TimerRegister {
            frequency_hz,
            running: false,
            anchor_time: 0.0,
            anchor_value: 0,
            modulus,
            down_counting,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts (or resumes) counting from `now`, preserving the current
    /// value as the new anchor.
    pub fn start(&mut self, now: f64) {
        let value = self.value(now);
        self.anchor_time = now;
        self.anchor_value = value;
        self.running = true;
    }

    pub fn stop(&mut self, now: f64) {
        self.anchor_value = self.value(now);
        self.anchor_time = now;
        self.running = false;
    }

    pub fn set_frequency(&mut self, now: f64, frequency_hz: f64) {
        self.anchor_value = self.value(now);
        self.anchor_time = now;
        self.frequency_hz = frequency_hz;
    }

    /// Directly sets the counter's value (e.g. a software reload), keeping
    /// the anchor current.
    pub fn set_value(&mut self, now: f64, value: u32) {
        self.anchor_time = now;
        self.anchor_value = value;
    }

    /// Current counter value at time `now`, accounting for elapsed ticks
    /// since the anchor and wrapping at `modulus`.
    pub fn value(&self, now: f64) -> u32 {
        if !self.running || self.modulus == 0 {
            return self.anchor_value;
        }
        let elapsed_secs = (now - self.anchor_time).max(0.0);
        let elapsed_ticks = (elapsed_secs * self.frequency_hz) as u64;
        if self.down_counting {
            let remaining = (self.anchor_value as u64) as i64 - elapsed_ticks as i64;
            let wrapped = remaining.rem_euclid(self.modulus as i64);
            wrapped as u32
        } else {
            let total = self.anchor_value as u64 + elapsed_ticks;
            (total % self.modulus) as u32
        }
    }

    /// Seconds until the counter next reaches `threshold` counting forward
    /// (up-counting) or reaches zero (down-counting), from time `now`. The
    /// caller's tick loop uses this to schedule when to re-sample and fire
    /// a callback, rather than this type owning a thread of its own.
    pub fn seconds_until(&self, now: f64, threshold: u32) -> Option<f64> {
        if !self.running || self.frequency_hz <= 0.0 {
            return None;
        }
        let current = self.value(now) as u64;
        let ticks_remaining = if self.down_counting {
            current
        } else {
            let target = threshold as u64;
            if target >= current {
                target - current
            } else {
                self.modulus - current + target
            }
        };
        Some(ticks_remaining as f64 / self.frequency_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_counter_advances_with_time() {
        let mut t = TimerRegister::new(1_000_000.0, false, 1 << 16);
        t.start(0.0);
        assert_eq!(t.value(0.0), 0);
        assert_eq!(t.value(0.001), 1000);
    }

    #[test]
    fn down_counter_reaches_zero_and_wraps() {
        let mut t = TimerRegister::new(1.0, true, 1 << 8);
        t.set_value(0.0, 10);
        t.start(0.0);
        assert_eq!(t.value(5.0), 5);
        assert_eq!(t.value(10.0), 0);
        // One more second past zero wraps around the modulus.
        assert_eq!(t.value(11.0), 255);
    }

    #[test]
    fn stopped_timer_freezes_value() {
        let mut t = TimerRegister::new(1000.0, false, 1 << 16);
        t.start(0.0);
        t.stop(0.5);
        assert_eq!(t.value(0.5), 500);
        assert_eq!(t.value(10.0), 500);
    }

    #[test]
    fn seconds_until_threshold_up_counting() {
        let mut t = TimerRegister::new(10.0, false, 1000);
        t.start(0.0);
        assert_eq!(t.seconds_until(0.0, 50), Some(5.0));
    }
}

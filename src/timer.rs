/*! Manually clocked millisecond timers.

The watchdog ticks these with measured wall time; tests tick them with
whatever virtual time they like. Nothing here ever reads the system
clock, which is what makes the drop-timeout behavior testable.
*/

/// Millisecond countdown timer.
#[derive(Clone, Debug)]
pub struct Timer {
    timeout_ms: u64,
    elapsed_ms: u64,
    running: bool,
}

impl Timer {
    /// New stopped timer expiring `timeout_ms` after start.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            elapsed_ms: 0,
            running: false,
        }
    }

    /// Replace the timeout; also resets elapsed time.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.elapsed_ms = 0;
    }

    /// Configured timeout.
    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// (Re)start from zero.
    pub fn start(&mut self) {
        self.elapsed_ms = 0;
        self.running = true;
    }

    /// Stop and reset.
    pub fn stop(&mut self) {
        self.elapsed_ms = 0;
        self.running = false;
    }

    /// Whether the timer is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance by `ms` if running.
    pub fn clock(&mut self, ms: u64) {
        if self.running {
            self.elapsed_ms = self.elapsed_ms.saturating_add(ms);
        }
    }

    /// Whether the timeout has been reached.
    pub fn has_expired(&self) -> bool {
        self.running && self.elapsed_ms >= self.timeout_ms
    }

    /// Milliseconds accumulated since start.
    pub fn elapsed(&self) -> u64 {
        self.elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_only_when_running() {
        let mut t = Timer::new(100);
        t.clock(500);
        assert!(!t.has_expired());

        t.start();
        t.clock(99);
        assert!(!t.has_expired());
        t.clock(1);
        assert!(t.has_expired());

        t.stop();
        assert!(!t.has_expired());
    }

    #[test]
    fn restart_resets_elapsed() {
        let mut t = Timer::new(50);
        t.start();
        t.clock(49);
        t.start();
        t.clock(10);
        assert!(!t.has_expired());
        assert_eq!(t.elapsed(), 10);
    }
}

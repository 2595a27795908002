//! Guest timing synchronization.
//!
//! Global time is `timestamp + (slice_length - downcount)`: compiled code
//! only ever decrements the downcount slot of the register file, and the
//! dispatcher's outer loop folds the consumed cycles back into the
//! timestamp when it starts a new slice.
//!
//! Two units finish work asynchronously: the multiply/divide unit and the
//! vector coprocessor pipeline. Each records the global time at which its
//! result becomes visible; reading the result earlier stalls the counter
//! forward to that time.

use crate::cpu::state::GuestRegisters;

/// Source of scheduled events (timers, video, DMA...).
pub trait EventScheduler {
    /// Run everything due at or before `now` and return the global time of
    /// the next pending event.
    fn advance(&mut self, now: u64) -> u64;
}

/// Scheduler with nothing on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScheduler;

impl EventScheduler for NullScheduler {
    fn advance(&mut self, _now: u64) -> u64 {
        u64::MAX
    }
}

/// Scheduler firing at a fixed period, mostly useful for tests.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicScheduler {
    pub period: u64,
    pub fired: u64,
}

impl PeriodicScheduler {
    pub fn new(period: u64) -> Self {
        Self {
            period: period.max(1),
            fired: 0,
        }
    }
}

impl EventScheduler for PeriodicScheduler {
    fn advance(&mut self, now: u64) -> u64 {
        let next = (now / self.period + 1) * self.period;
        self.fired = now / self.period;
        next
    }
}

/// Cycle accounting shared by compiled code and the interpreter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingState {
    /// Global time at the start of the current slice.
    timestamp: u64,
    /// Length the downcount was loaded with at slice start.
    slice_length: i64,
    next_event: u64,
    muldiv_done: u64,
    cop_done: u64,
}

impl TimingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact global time for the current downcount.
    #[inline]
    pub fn now(&self, regs: &GuestRegisters) -> u64 {
        let consumed = self.slice_length - regs.downcount() as i64;
        self.timestamp.saturating_add_signed(consumed)
    }

    pub fn slice_start(&self) -> u64 {
        self.timestamp
    }

    pub fn slice_length(&self) -> i64 {
        self.slice_length
    }

    pub fn next_event(&self) -> u64 {
        self.next_event
    }

    /// Fold the cycles consumed so far into the timestamp and open a new
    /// slice running up to the next event. Returns the new downcount; a
    /// negative value means the event is already due.
    pub fn update_from_downcount(&mut self, regs: &mut GuestRegisters) -> i32 {
        self.timestamp = self.now(regs);
        let slice = self.next_event as i128 - self.timestamp as i128;
        let slice = slice.clamp(i32::MIN as i128, i32::MAX as i128) as i32;
        self.slice_length = slice as i64;
        regs.set_downcount(slice);
        slice
    }

    /// Schedule the end of the current slice.
    pub fn set_next_event(&mut self, regs: &mut GuestRegisters, when: u64) -> i32 {
        self.next_event = when;
        self.update_from_downcount(regs)
    }

    /// End the slice at the next block boundary.
    pub fn force_check(&mut self, regs: &mut GuestRegisters) {
        self.timestamp = self.now(regs);
        self.slice_length = -1;
        regs.set_downcount(-1);
    }

    /// Burn `cycles` of guest time immediately.
    pub fn stall(&mut self, regs: &mut GuestRegisters, cycles: u64) {
        let cycles = cycles.min(i32::MAX as u64) as i32;
        regs.set_downcount(regs.downcount().wrapping_sub(cycles));
    }

    /// Stall until `target` if it lies in the future. Returns the cycles burnt.
    pub fn stall_until(&mut self, regs: &mut GuestRegisters, target: u64) -> u64 {
        let now = self.now(regs);
        if target > now {
            let wait = target - now;
            self.stall(regs, wait);
            wait
        } else {
            0
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Multiply/divide unit
    // ═══════════════════════════════════════════════════════════════════════

    pub fn muldiv_done(&self) -> u64 {
        self.muldiv_done
    }

    pub fn schedule_muldiv(&mut self, regs: &GuestRegisters, latency: u32) {
        self.muldiv_done = self.now(regs) + latency as u64;
    }

    /// Wait for HI/LO to become readable.
    pub fn sync_muldiv(&mut self, regs: &mut GuestRegisters) -> u64 {
        let done = self.muldiv_done;
        self.stall_until(regs, done)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Coprocessor pipeline
    // ═══════════════════════════════════════════════════════════════════════

    pub fn cop_done(&self) -> u64 {
        self.cop_done
    }

    pub fn schedule_cop(&mut self, regs: &GuestRegisters, latency: u32) {
        self.cop_done = self.now(regs) + latency as u64;
    }

    pub fn sync_cop(&mut self, regs: &mut GuestRegisters) -> u64 {
        let done = self.cop_done;
        self.stall_until(regs, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_accounting() {
        let mut regs = GuestRegisters::new();
        let mut timing = TimingState::new();
        assert_eq!(timing.set_next_event(&mut regs, 100), 100);
        assert_eq!(timing.now(&regs), 0);

        regs.set_downcount(60);
        assert_eq!(timing.now(&regs), 40);

        timing.update_from_downcount(&mut regs);
        assert_eq!(timing.slice_start(), 40);
        assert_eq!(regs.downcount(), 60);
        assert_eq!(timing.now(&regs), 40);
    }

    #[test]
    fn test_overshoot_goes_negative() {
        let mut regs = GuestRegisters::new();
        let mut timing = TimingState::new();
        timing.set_next_event(&mut regs, 10);
        regs.set_downcount(-3);
        assert_eq!(timing.now(&regs), 13);
        assert_eq!(timing.update_from_downcount(&mut regs), -3);
    }

    #[test]
    fn test_force_check() {
        let mut regs = GuestRegisters::new();
        let mut timing = TimingState::new();
        timing.set_next_event(&mut regs, 1000);
        regs.set_downcount(990);
        timing.force_check(&mut regs);
        assert_eq!(regs.downcount(), -1);
        assert_eq!(timing.now(&regs), 10);
    }

    #[test]
    fn test_muldiv_stall() {
        let mut regs = GuestRegisters::new();
        let mut timing = TimingState::new();
        timing.set_next_event(&mut regs, 1000);
        timing.schedule_muldiv(&regs, 36);
        regs.set_downcount(990);
        assert_eq!(timing.sync_muldiv(&mut regs), 26);
        assert_eq!(timing.now(&regs), 36);
        // Already complete: no further stall.
        assert_eq!(timing.sync_muldiv(&mut regs), 0);
    }

    #[test]
    fn test_cop_stall() {
        let mut regs = GuestRegisters::new();
        let mut timing = TimingState::new();
        timing.set_next_event(&mut regs, 1000);
        timing.schedule_cop(&regs, 12);
        assert_eq!(timing.sync_cop(&mut regs), 12);
        assert_eq!(regs.downcount(), 988);
    }

    #[test]
    fn test_periodic_scheduler() {
        let mut sched = PeriodicScheduler::new(50);
        assert_eq!(sched.advance(10), 50);
        assert_eq!(sched.advance(50), 100);
        assert_eq!(sched.fired, 1);
    }
}

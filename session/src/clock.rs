//! Shared simulation time.
//!
//! The master stamps its clock into a time anchor on two independent
//! cadences. A client never jumps to an anchor once the race runs: it walks
//! its clock toward it by a bounded step per tick.

use shared::{COARSE_ANCHOR_PERIOD_MS, FINE_ANCHOR_PERIOD_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorCadence {
    Coarse,
    Fine,
}

/// Master-side timer for the two anchor cadences, driven by session uptime.
#[derive(Debug, Clone)]
pub struct AnchorSchedule {
    next_coarse: i64,
    next_fine: i64,
}

impl Default for AnchorSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorSchedule {
    pub fn new() -> Self {
        Self {
            next_coarse: COARSE_ANCHOR_PERIOD_MS,
            next_fine: FINE_ANCHOR_PERIOD_MS,
        }
    }

    /// Returns the cadence that fell due at `uptime`, if any. When both fall
    /// due in the same tick a single anchor serves them.
    pub fn poll(&mut self, uptime: i64) -> Option<AnchorCadence> {
        let coarse = advance(&mut self.next_coarse, COARSE_ANCHOR_PERIOD_MS, uptime);
        let fine = advance(&mut self.next_fine, FINE_ANCHOR_PERIOD_MS, uptime);

        match (coarse, fine) {
            (true, _) => Some(AnchorCadence::Coarse),
            (false, true) => Some(AnchorCadence::Fine),
            (false, false) => None,
        }
    }
}

fn advance(next: &mut i64, period: i64, uptime: i64) -> bool {
    if uptime < *next {
        return false;
    }
    while *next <= uptime {
        *next += period;
    }
    true
}

/// Client-side correction toward the last anchor received.
#[derive(Debug, Clone)]
pub struct ClockSync {
    pending: i64,
    max_step: i64,
    tolerance: i64,
    anchors: u32,
}

impl ClockSync {
    pub fn new(max_step: i64, tolerance: i64) -> Self {
        Self {
            pending: 0,
            max_step: max_step.max(1),
            tolerance: tolerance.max(0),
            anchors: 0,
        }
    }

    /// Replaces any correction still in progress with the offset between the
    /// anchor and the local clock.
    pub fn on_anchor(&mut self, anchor: i64, local: i64) {
        self.pending = anchor - local;
        self.anchors += 1;
    }

    /// Milliseconds to add to the local clock this tick. Never larger than
    /// the remaining offset, zero once inside the tolerance window.
    pub fn correction(&mut self) -> i64 {
        if self.pending.abs() <= self.tolerance {
            return 0;
        }
        let step = self.pending.clamp(-self.max_step, self.max_step);
        self.pending -= step;
        step
    }

    pub fn pending_offset(&self) -> i64 {
        self.pending
    }

    pub fn anchors_received(&self) -> u32 {
        self.anchors
    }

    pub fn is_synchronized(&self) -> bool {
        self.anchors > 0 && self.pending.abs() <= self.tolerance
    }

    /// Drops the correction in progress, used when the clock is set outright.
    pub fn reset(&mut self) {
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_cadences() {
        let mut schedule = AnchorSchedule::new();

        assert_eq!(schedule.poll(7_999), None);
        assert_eq!(schedule.poll(8_000), Some(AnchorCadence::Fine));
        assert_eq!(schedule.poll(8_016), None);
        assert_eq!(schedule.poll(12_000), Some(AnchorCadence::Coarse));
        assert_eq!(schedule.poll(16_000), Some(AnchorCadence::Fine));
        assert_eq!(schedule.poll(24_000), Some(AnchorCadence::Coarse));
        // The fine cadence was served by the same anchor
        assert_eq!(schedule.poll(24_010), None);
        assert_eq!(schedule.poll(32_000), Some(AnchorCadence::Fine));
    }

    #[test]
    fn test_schedule_skips_missed_periods() {
        let mut schedule = AnchorSchedule::new();

        assert_eq!(schedule.poll(50_000), Some(AnchorCadence::Coarse));
        assert_eq!(schedule.poll(50_001), None);
        assert_eq!(schedule.poll(56_000), Some(AnchorCadence::Fine));
        assert_eq!(schedule.poll(60_000), Some(AnchorCadence::Coarse));
    }

    #[test]
    fn test_correction_converges_monotonically() {
        let mut sync = ClockSync::new(20, 5);
        let anchor = 0;
        let mut local = 500;
        sync.on_anchor(anchor, local);

        let mut previous = (local - anchor).abs();
        while !sync.is_synchronized() {
            local += sync.correction();
            let offset = local - anchor;
            assert!(offset >= 0, "overshot past the anchor: {}", offset);
            assert!(offset.abs() < previous);
            previous = offset.abs();
        }
        assert_eq!(local, 0);
    }

    #[test]
    fn test_correction_negative_clock() {
        let mut sync = ClockSync::new(50, 5);
        let mut local = -13_000;
        sync.on_anchor(-12_870, local);

        let mut steps = 0;
        while sync.pending_offset().abs() > 5 {
            let step = sync.correction();
            assert!(step > 0 && step <= 50);
            local += step;
            steps += 1;
        }
        assert_eq!(local, -12_870);
        assert_eq!(steps, 3);
    }

    #[test]
    fn test_correction_stops_inside_tolerance() {
        let mut sync = ClockSync::new(20, 5);
        sync.on_anchor(1000, 997);

        assert_eq!(sync.correction(), 0);
        assert_eq!(sync.pending_offset(), 3);
        assert!(sync.is_synchronized());
    }

    #[test]
    fn test_no_anchor_no_correction() {
        let mut sync = ClockSync::new(20, 5);
        assert_eq!(sync.correction(), 0);
        assert!(!sync.is_synchronized());
        assert_eq!(sync.anchors_received(), 0);
    }

    #[test]
    fn test_new_anchor_replaces_pending() {
        let mut sync = ClockSync::new(20, 0);
        sync.on_anchor(0, 500);
        sync.correction();
        sync.on_anchor(100, 80);

        assert_eq!(sync.pending_offset(), 20);
        assert_eq!(sync.correction(), 20);
        assert_eq!(sync.correction(), 0);
    }
}

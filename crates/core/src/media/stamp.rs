//! Per-track timestamp smoother.
//!
//! Turns an input clock that may start anywhere, jump, or step backwards
//! into a relative, monotonic one starting at 0. Jumps larger than
//! [`MAX_DELTA_MS`] in either direction are treated as a discontinuity and
//! advance the output by nothing. The pts-dts offset of each frame is kept
//! when it is within the same bound.

/// Largest dts step accepted as continuous.
pub const MAX_DELTA_MS: i64 = 1000;

#[derive(Debug, Default)]
pub struct Stamp {
    last_dts_in: Option<i64>,
    relative: i64,
}

impl Stamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rewritten `(dts, pts)`.
    pub fn revise(&mut self, dts: u64, pts: u64) -> (u64, u64) {
        let dts_in = dts as i64;
        let pts_in = if pts == 0 { dts_in } else { pts as i64 };

        if let Some(last) = self.last_dts_in {
            let delta = dts_in - last;
            if (0..=MAX_DELTA_MS).contains(&delta) {
                self.relative += delta;
            } else if delta.abs() > MAX_DELTA_MS {
                tracing::debug!(last, dts = dts_in, "timestamp discontinuity");
            }
            // small negative steps hold the output still
        }
        if self.last_dts_in.is_none_or(|last| dts_in >= last || (dts_in - last).abs() > MAX_DELTA_MS) {
            self.last_dts_in = Some(dts_in);
        }

        let offset = pts_in - dts_in;
        let offset = if offset.abs() <= MAX_DELTA_MS { offset } else { 0 };
        let dts_out = self.relative;
        let pts_out = (dts_out + offset).max(0);
        (dts_out as u64, pts_out as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let mut s = Stamp::new();
        assert_eq!(s.revise(123_456, 123_456), (0, 0));
        assert_eq!(s.revise(123_496, 123_496), (40, 40));
    }

    #[test]
    fn keeps_pts_offset() {
        let mut s = Stamp::new();
        s.revise(1000, 1000);
        assert_eq!(s.revise(1040, 1120), (40, 120));
    }

    #[test]
    fn jump_forward_is_a_discontinuity() {
        let mut s = Stamp::new();
        s.revise(0, 0);
        s.revise(40, 40);
        assert_eq!(s.revise(90_000, 90_000), (40, 40));
        assert_eq!(s.revise(90_040, 90_040), (80, 80));
    }

    #[test]
    fn never_steps_backwards() {
        let mut s = Stamp::new();
        s.revise(1000, 1000);
        s.revise(1040, 1040);
        let (dts, _) = s.revise(1020, 1020);
        assert_eq!(dts, 40);
        let (dts, _) = s.revise(1080, 1080);
        assert_eq!(dts, 80);
    }
}

//! Current-limiting-receiver (CLR) video rate control.
//!
//! Once per second every participant reports, for the master's video stream,
//! the optimal sending rate its tracker derived. Only the master adapts: the
//! reporter currently governing the rate is the CLR. A challenger displaces
//! the CLR only by offering a strictly lower rate; the sitting CLR's reports
//! are always adopted. Adopted rates are blended into the live rate to damp
//! oscillation.

use tracing::debug;

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Seconds between feedback reports from each participant.
pub const FEEDBACK_INTERVAL: f64 = 1.0;

/// Blend weights: `rate = 0.6 * current + 0.4 * proposed`.
const KEEP_WEIGHT: f64 = 0.6;
const ADOPT_WEIGHT: f64 = 0.4;

/// Video send rate before any feedback arrives (units/s).
pub const DEFAULT_VIDEO_RATE: f64 = 24.0;

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RateController {
    /// Live outbound video rate in units/s.
    rate: f64,
    /// Name of the participant currently governing the rate.
    clr: Option<String>,
    /// The CLR's last raw (pre-blend) proposal.
    clr_rate: f64,
}

impl RateController {
    pub fn new(initial_rate: f64) -> Self {
        Self {
            rate: initial_rate,
            clr: None,
            clr_rate: 0.0,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn clr(&self) -> Option<&str> {
        self.clr.as_deref()
    }

    /// Apply one feedback report. Returns true if the report was adopted.
    pub fn feedback(&mut self, source: &str, proposed: u32) -> bool {
        let adopt = match self.clr.as_deref() {
            None => true,
            Some(current) if current == source => true,
            // A different reporter wins only with a strictly lower rate.
            Some(_) => f64::from(proposed) < self.clr_rate,
        };
        if !adopt {
            return false;
        }

        self.clr = Some(source.to_owned());
        self.clr_rate = f64::from(proposed);
        self.rate = KEEP_WEIGHT * self.rate + ADOPT_WEIGHT * self.clr_rate;
        debug!(clr = source, proposed, rate = self.rate, "adopted rate feedback");
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reporter_becomes_clr() {
        let mut rc = RateController::new(30.0);
        assert!(rc.feedback("bob", 20));
        assert_eq!(rc.clr(), Some("bob"));
        assert!((rc.rate() - (0.6 * 30.0 + 0.4 * 20.0)).abs() < 1e-9);
    }

    #[test]
    fn sitting_clr_is_always_adopted() {
        let mut rc = RateController::new(30.0);
        rc.feedback("bob", 20);
        // Even a higher rate from the CLR is taken.
        assert!(rc.feedback("bob", 40));
        assert_eq!(rc.clr(), Some("bob"));
    }

    #[test]
    fn challenger_needs_strictly_lower_rate() {
        let mut rc = RateController::new(30.0);
        rc.feedback("bob", 20);
        assert!(!rc.feedback("carol", 20), "equal rate must not displace");
        assert!(!rc.feedback("carol", 25));
        assert_eq!(rc.clr(), Some("bob"));
        assert!(rc.feedback("carol", 19));
        assert_eq!(rc.clr(), Some("carol"));
    }

    #[test]
    fn blending_damps_oscillation() {
        let mut rc = RateController::new(24.0);
        rc.feedback("bob", 4);
        assert!(rc.rate() > 4.0, "one report must not collapse the rate");
        for _ in 0..20 {
            rc.feedback("bob", 4);
        }
        assert!((rc.rate() - 4.0).abs() < 0.1, "repeated reports converge");
    }
}

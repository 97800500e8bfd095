//! Per-remote-peer statistics tracker.
//!
//! One [`Tracker`] per (remote participant, medium). It gatekeeps incoming
//! units (sequence window + replay check) and maintains rolling estimates of
//! latency, framerate, bitrate, and framedrop using an adaptive exponential
//! moving average: the weight of a new sample is `1 − e^(−Δt)`, so a long gap
//! since the previous update weights the new sample more heavily.

use std::collections::HashMap;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Counter/byte accumulators flush into the averages at most this often (s).
pub const FLUSH_INTERVAL: f64 = 0.5;

/// A unit trailing the expected sequence pointer by more than this is dropped.
pub const SEQ_LAG_MAX: u64 = 3;

/// How many recently-accepted packet nonces are remembered for replay checks.
pub const NONCE_WINDOW: usize = 3;

/// How many recently-arrived sequence numbers are remembered.
pub const SEQ_WINDOW: usize = 3;

/// A pending sequence number is declared lost after this many strikes.
pub const STRIKE_LIMIT: u8 = 2;

/// `optimal_sending_rate` = round(this / latency-in-seconds).
pub const RATE_CONSTANT: f64 = 2.0;

// ---------------------------------------------------------------------------
// Rolling estimates
// ---------------------------------------------------------------------------

/// Current smoothed estimates. All zero until the first samples arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    /// One-way latency in seconds (sender timestamp to local arrival).
    pub latency: f64,
    /// Units per second.
    pub framerate: f64,
    /// Payload bytes per second.
    pub bitrate: f64,
    /// Lost / (lost + received) over recent flush windows.
    pub framedrop: f64,
}

/// `1 − e^(−Δt)`: the EMA weight of a sample arriving `delta_t` seconds after
/// the previous one.
fn exp_weight(delta_t: f64) -> f64 {
    1.0 - (-delta_t).exp()
}

/// Blend a new sample into a running average, seeding it directly if the
/// average is still zero.
fn blend(avg: &mut f64, sample: f64, weight: f64) {
    if *avg == 0.0 {
        *avg = sample;
    } else {
        *avg = weight * sample + (1.0 - weight) * *avg;
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Tracker {
    /// Next sequence number we account for. Advances by exactly one per
    /// processed unit, never jumps.
    expected_seq: u64,
    /// In-flight sequence numbers with their strike counts.
    pending: HashMap<u64, u8>,
    /// Ring of recently-arrived sequence numbers.
    recent_seqs: VecDeque<u64>,
    /// Ring of recently-accepted packet nonces.
    recent_nonces: VecDeque<u64>,

    stats: Stats,
    /// When the latency estimate last absorbed a sample.
    last_update: f64,
    /// Start of the current accumulation window.
    last_flush: f64,
    units_acc: u64,
    bytes_acc: u64,
    received_acc: u64,
    lost_acc: u64,
}

impl Tracker {
    /// `now` is seconds since the Unix epoch (or any monotone origin shared
    /// with later calls).
    pub fn new(now: f64) -> Self {
        Self {
            expected_seq: 0,
            pending: HashMap::new(),
            recent_seqs: VecDeque::with_capacity(SEQ_WINDOW),
            recent_nonces: VecDeque::with_capacity(NONCE_WINDOW),
            stats: Stats::default(),
            last_update: now,
            last_flush: now,
            units_acc: 0,
            bytes_acc: 0,
            received_acc: 0,
            lost_acc: 0,
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    // -----------------------------------------------------------------------
    // Integrity gate
    // -----------------------------------------------------------------------

    /// Accept or reject a unit before any statistics are touched.
    ///
    /// Rejects units trailing the expected pointer by more than
    /// [`SEQ_LAG_MAX`], and units whose packet nonce repeats one of the last
    /// [`NONCE_WINDOW`] accepted nonces. Accepted nonces are recorded here.
    pub fn admit(&mut self, seq: u64, packet_nonce: u64) -> bool {
        if seq + SEQ_LAG_MAX < self.expected_seq {
            return false;
        }
        if self.recent_nonces.contains(&packet_nonce) {
            return false;
        }
        if self.recent_nonces.len() == NONCE_WINDOW {
            self.recent_nonces.pop_front();
        }
        self.recent_nonces.push_back(packet_nonce);
        true
    }

    // -----------------------------------------------------------------------
    // Estimator update
    // -----------------------------------------------------------------------

    /// Account one admitted unit. `sent_at` is the sender's embedded
    /// timestamp, in the same clock as `now`.
    pub fn record(&mut self, seq: u64, payload_len: usize, sent_at: f64, now: f64) {
        self.update_latency(sent_at, now);

        self.units_acc += 1;
        self.bytes_acc += payload_len as u64;
        self.received_acc += 1;

        self.track_sequence(seq);
        self.maybe_flush(now);
    }

    fn update_latency(&mut self, sent_at: f64, now: f64) {
        let sample = (now - sent_at).max(0.0);
        let weight = exp_weight(now - self.last_update);
        blend(&mut self.stats.latency, sample, weight);
        self.last_update = now;
    }

    /// The pending-ledger framedrop bookkeeping.
    fn track_sequence(&mut self, seq: u64) {
        self.pending.remove(&seq);

        // Every entry that was already pending takes a strike; two strikes
        // means lost.
        let mut expired = Vec::new();
        for (&s, strikes) in self.pending.iter_mut() {
            *strikes += 1;
            if *strikes >= STRIKE_LIMIT {
                expired.push(s);
            }
        }
        for s in expired {
            self.pending.remove(&s);
            self.lost_acc += 1;
            // A declared loss is accounted for, so the pointer moves past it.
            // Without this the pointer falls behind the stream by the total
            // loss count and resolved sequences get re-pended forever.
            self.expected_seq += 1;
        }

        // Every gap sequence between the pointer and the arrival becomes
        // pending (at zero strikes), unless it already arrived or is already
        // pending.
        for gap in self.expected_seq..seq {
            if !self.pending.contains_key(&gap) && !self.recent_seqs.contains(&gap) {
                self.pending.insert(gap, 0);
            }
        }

        if self.recent_seqs.len() == SEQ_WINDOW {
            self.recent_seqs.pop_front();
        }
        self.recent_seqs.push_back(seq);

        // One step per processed unit; the pointer never jumps to `seq`.
        self.expected_seq += 1;
    }

    fn maybe_flush(&mut self, now: f64) {
        let elapsed = now - self.last_flush;
        if elapsed < FLUSH_INTERVAL {
            return;
        }
        let weight = exp_weight(elapsed);

        blend(
            &mut self.stats.framerate,
            self.units_acc as f64 / elapsed,
            weight,
        );
        blend(
            &mut self.stats.bitrate,
            self.bytes_acc as f64 / elapsed,
            weight,
        );

        let total = self.lost_acc + self.received_acc;
        if total > 0 {
            let ratio = self.lost_acc as f64 / total as f64;
            // A clean window must pull the estimate down, so a zero ratio is
            // blended, not skipped.
            let w = weight;
            self.stats.framedrop = w * ratio + (1.0 - w) * self.stats.framedrop;
        }

        self.units_acc = 0;
        self.bytes_acc = 0;
        self.received_acc = 0;
        self.lost_acc = 0;
        self.last_flush = now;
    }

    // -----------------------------------------------------------------------
    // Rate suggestion
    // -----------------------------------------------------------------------

    /// Sending rate (units/s) this peer could sustain toward us, derived from
    /// the latency estimate. `None` until the first latency sample.
    pub fn optimal_sending_rate(&self) -> Option<u32> {
        if self.stats.latency == 0.0 {
            return None;
        }
        Some((RATE_CONSTANT / self.stats.latency).round() as u32)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1000.0;

    fn feed(tracker: &mut Tracker, seq: u64, nonce: u64, now: f64) -> bool {
        if !tracker.admit(seq, nonce) {
            return false;
        }
        tracker.record(seq, 100, now - 0.05, now);
        true
    }

    #[test]
    fn first_latency_sample_is_taken_directly() {
        let mut t = Tracker::new(T0);
        assert_eq!(t.optimal_sending_rate(), None);
        assert!(feed(&mut t, 0, 1, T0 + 1.0));
        assert!((t.stats().latency - 0.05).abs() < 1e-9);
        assert_eq!(t.optimal_sending_rate(), Some(40)); // 2.0 / 0.05
    }

    #[test]
    fn latency_ema_moves_toward_new_samples() {
        let mut t = Tracker::new(T0);
        feed(&mut t, 0, 1, T0 + 1.0);
        let before = t.stats().latency;
        // A much slower packet after a 1s gap.
        t.admit(1, 2);
        t.record(1, 100, T0 + 2.0 - 0.5, T0 + 2.0);
        let after = t.stats().latency;
        assert!(after > before);
        assert!(after < 0.5, "EMA must not jump all the way to the sample");
        let expected = exp_weight(1.0) * 0.5 + (1.0 - exp_weight(1.0)) * before;
        assert!((after - expected).abs() < 1e-9);
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let mut t = Tracker::new(T0);
        assert!(t.admit(0, 7));
        assert!(!t.admit(1, 7), "nonce 7 repeats the last accepted nonce");
        // After three more accepted nonces, 7 falls out of the window.
        assert!(t.admit(1, 8));
        assert!(t.admit(2, 9));
        assert!(t.admit(3, 10));
        assert!(t.admit(4, 7));
    }

    #[test]
    fn stale_sequence_is_rejected() {
        let mut t = Tracker::new(T0);
        let mut now = T0;
        for seq in 0..6 {
            now += 0.01;
            assert!(feed(&mut t, seq, 100 + seq, now));
        }
        assert_eq!(t.expected_seq(), 6);
        // 6 - 3 = 3 is still admissible, 2 is not.
        assert!(t.admit(3, 200));
        assert!(!t.admit(2, 201));
    }

    #[test]
    fn pointer_advances_one_per_unit_even_across_gaps() {
        let mut t = Tracker::new(T0);
        feed(&mut t, 0, 1, T0 + 0.01);
        feed(&mut t, 5, 2, T0 + 0.02);
        assert_eq!(t.expected_seq(), 2);
    }

    #[test]
    fn two_strikes_declare_a_loss() {
        let mut t = Tracker::new(T0);
        // Sequence 1 never arrives.
        feed(&mut t, 0, 1, T0 + 0.01);
        feed(&mut t, 2, 2, T0 + 0.02); // 1 goes pending (strike 0)
        feed(&mut t, 3, 3, T0 + 0.03); // strike 1
        feed(&mut t, 4, 4, T0 + 0.04); // strike 2 -> lost
        assert!(t.pending.is_empty());
        assert_eq!(t.lost_acc, 1);
        // Pointer accounts for four received units and one loss.
        assert_eq!(t.expected_seq(), 5);
    }

    #[test]
    fn late_arrival_before_expiry_is_not_a_loss() {
        let mut t = Tracker::new(T0);
        feed(&mut t, 0, 1, T0 + 0.01);
        feed(&mut t, 2, 2, T0 + 0.02); // 1 pending
        feed(&mut t, 1, 3, T0 + 0.03); // 1 arrives late
        assert_eq!(t.lost_acc, 0);
        assert!(t.pending.is_empty());
    }

    #[test]
    fn framedrop_converges_to_loss_fraction() {
        // 1 in every 10 sequence numbers never arrives; the estimate should
        // settle near 0.1.
        let mut t = Tracker::new(T0);
        let mut now = T0;
        let mut nonce = 0u64;
        for seq in 0..2000u64 {
            if seq % 10 == 9 {
                continue;
            }
            now += 0.02;
            nonce += 1;
            assert!(feed(&mut t, seq, nonce, now));
        }
        let drop = t.stats().framedrop;
        assert!(
            (drop - 0.1).abs() < 0.02,
            "framedrop {drop} did not converge near 0.1"
        );
    }

    #[test]
    fn framerate_and_bitrate_flush_on_cadence() {
        let mut t = Tracker::new(T0);
        let mut now = T0;
        for seq in 0..50u64 {
            now += 0.025; // 40 units/s
            t.admit(seq, seq + 1);
            t.record(seq, 200, now - 0.01, now);
        }
        let stats = t.stats();
        assert!((stats.framerate - 40.0).abs() < 2.0, "{}", stats.framerate);
        assert!((stats.bitrate - 8000.0).abs() < 400.0, "{}", stats.bitrate);
    }
}

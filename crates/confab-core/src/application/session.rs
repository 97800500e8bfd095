//! Peer-local call session state.
//!
//! A [`CallSession`] mirrors one registered call from this participant's
//! viewpoint: key material, per-peer trackers, per-medium sequence counters
//! and send flags, and the rate controller. It is shared (`Arc`) between the
//! peer event loop and the media workers, so the mutable pieces sit behind
//! short-lived mutexes or atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::domain::media::MediaUnit;
use crate::domain::roster::{CallInfo, Medium};

use super::rate::{RateController, DEFAULT_VIDEO_RATE};
use super::tracker::{Stats, Tracker};

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// The shared secrets distributed by the call master.
#[derive(Clone)]
pub struct SessionKeys {
    pub key: [u8; 32],
    pub iv: [u8; 12],
    pub session_nonce: u64,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"***")
            .field("iv", &"***")
            .field("session_nonce", &self.session_nonce)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-medium state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PerMedium<T> {
    audio: T,
    video: T,
    chat: T,
}

impl<T> PerMedium<T> {
    fn get(&self, medium: Medium) -> &T {
        match medium {
            Medium::Audio => &self.audio,
            Medium::Video => &self.video,
            Medium::Chat => &self.chat,
        }
    }
}

// ---------------------------------------------------------------------------
// CallSession
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CallSession {
    pub local_name: String,
    info: Mutex<CallInfo>,
    keys: Mutex<Option<SessionKeys>>,
    /// Cleared on teardown; every worker polls it.
    running: AtomicBool,
    send_enabled: PerMedium<AtomicBool>,
    seqs: PerMedium<AtomicU64>,
    /// Per-remote-peer estimators, audio and video separately. Chat volumes
    /// are too low to be worth estimating.
    trackers: PerMedium<Mutex<HashMap<String, Tracker>>>,
    /// Master-only adaptive state.
    rate: Mutex<RateController>,
    /// Live outbound video pace in units/s, read by the video send worker.
    video_rate: AtomicU32,
}

impl CallSession {
    pub fn new(local_name: String, info: CallInfo) -> Self {
        Self {
            local_name,
            info: Mutex::new(info),
            keys: Mutex::new(None),
            running: AtomicBool::new(true),
            send_enabled: PerMedium {
                audio: AtomicBool::new(true),
                video: AtomicBool::new(true),
                chat: AtomicBool::new(true),
            },
            seqs: PerMedium {
                audio: AtomicU64::new(0),
                video: AtomicU64::new(0),
                chat: AtomicU64::new(0),
            },
            trackers: PerMedium {
                audio: Mutex::new(HashMap::new()),
                video: Mutex::new(HashMap::new()),
                chat: Mutex::new(HashMap::new()),
            },
            rate: Mutex::new(RateController::new(DEFAULT_VIDEO_RATE)),
            video_rate: AtomicU32::new(DEFAULT_VIDEO_RATE as u32),
        }
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    pub fn info(&self) -> CallInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_info(&self, info: CallInfo) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }

    pub fn is_master(&self) -> bool {
        self.info().master == self.local_name
    }

    /// Remote participants, in call join order.
    pub fn remote_peers(&self) -> Vec<String> {
        self.info()
            .user_lst
            .into_iter()
            .filter(|n| *n != self.local_name)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle flag
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    pub fn set_keys(&self, keys: SessionKeys) {
        *self.keys.lock().unwrap_or_else(|e| e.into_inner()) = Some(keys);
    }

    pub fn keys(&self) -> Option<SessionKeys> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_keys(&self) -> bool {
        self.keys().is_some()
    }

    // -----------------------------------------------------------------------
    // Sequencing and send flags
    // -----------------------------------------------------------------------

    pub fn next_seq(&self, medium: Medium) -> u64 {
        self.seqs.get(medium).fetch_add(1, Ordering::Relaxed)
    }

    pub fn send_enabled(&self, medium: Medium) -> bool {
        self.send_enabled.get(medium).load(Ordering::Relaxed)
    }

    pub fn set_send_enabled(&self, medium: Medium, active: bool) {
        self.send_enabled.get(medium).store(active, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Incoming unit pipeline
    // -----------------------------------------------------------------------

    /// Session-nonce gate plus tracker integrity check and statistics update.
    /// Returns false when the unit must be dropped (silently, per protocol).
    pub fn accept_unit(&self, unit: &MediaUnit, now: f64) -> bool {
        let Some(keys) = self.keys() else {
            return false;
        };
        if unit.session_nonce != keys.session_nonce {
            return false;
        }
        if unit.source == self.local_name {
            // Our own multicast traffic looped back.
            return false;
        }

        let mut map = self
            .trackers
            .get(unit.medium)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let tracker = map
            .entry(unit.source.clone())
            .or_insert_with(|| Tracker::new(now));
        if !tracker.admit(unit.seq, unit.packet_nonce) {
            return false;
        }
        tracker.record(
            unit.seq,
            unit.wire_len(),
            unit.timestamp_us as f64 / 1e6,
            now,
        );
        true
    }

    /// Snapshot of a remote peer's estimates for one medium.
    pub fn peer_stats(&self, medium: Medium, source: &str) -> Option<Stats> {
        let map = self
            .trackers
            .get(medium)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.get(source).map(|t| t.stats())
    }

    /// Drop tracker state for a participant that left the call.
    pub fn forget_peer(&self, source: &str) {
        for medium in Medium::ALL {
            self.trackers
                .get(medium)
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(source);
        }
    }

    // -----------------------------------------------------------------------
    // Rate control
    // -----------------------------------------------------------------------

    /// The optimal rate this peer currently measures for each remote video
    /// sender. Reported to the master once per second.
    pub fn video_rate_suggestions(&self) -> Vec<(String, u32)> {
        let map = self
            .trackers
            .get(Medium::Video)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter_map(|(name, t)| t.optimal_sending_rate().map(|r| (name.clone(), r)))
            .collect()
    }

    /// Master-only: apply one CLR feedback report and refresh the live pace.
    pub fn apply_feedback(&self, source: &str, rate: u32) {
        let mut rc = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        if rc.feedback(source, rate) {
            self.video_rate
                .store(rc.rate().round().max(1.0) as u32, Ordering::Relaxed);
        }
    }

    pub fn video_send_rate(&self) -> u32 {
        self.video_rate.load(Ordering::Relaxed).max(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn session() -> CallSession {
        let info = CallInfo {
            master: "alice".into(),
            user_lst: vec!["alice".into(), "bob".into()],
            addrs: crate::domain::roster::MediaAddrs {
                audio: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)),
                video: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 2)),
                chat: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 3)),
            },
            key_addr: "10.0.0.1:50999".parse().unwrap(),
        };
        let s = CallSession::new("alice".into(), info);
        s.set_keys(SessionKeys {
            key: [7; 32],
            iv: [9; 12],
            session_nonce: 0xABCD,
        });
        s
    }

    fn unit(seq: u64, nonce: u64, session_nonce: u64) -> MediaUnit {
        MediaUnit {
            medium: Medium::Video,
            seq,
            session_nonce,
            packet_nonce: nonce,
            source: "bob".into(),
            timestamp_us: 1_000_000,
            payload: vec![0; 64],
        }
    }

    #[test]
    fn foreign_session_nonce_is_dropped() {
        let s = session();
        assert!(s.accept_unit(&unit(0, 1, 0xABCD), 2.0));
        assert!(!s.accept_unit(&unit(1, 2, 0xBEEF), 2.1));
    }

    #[test]
    fn own_loopback_is_dropped() {
        let s = session();
        let mut u = unit(0, 1, 0xABCD);
        u.source = "alice".into();
        assert!(!s.accept_unit(&u, 2.0));
    }

    #[test]
    fn replay_is_dropped_across_pipeline() {
        let s = session();
        assert!(s.accept_unit(&unit(0, 5, 0xABCD), 2.0));
        assert!(!s.accept_unit(&unit(1, 5, 0xABCD), 2.1));
    }

    #[test]
    fn sequence_counters_are_per_medium() {
        let s = session();
        assert_eq!(s.next_seq(Medium::Audio), 0);
        assert_eq!(s.next_seq(Medium::Audio), 1);
        assert_eq!(s.next_seq(Medium::Video), 0);
    }

    #[test]
    fn feedback_updates_send_pace() {
        let s = session();
        let before = s.video_send_rate();
        s.apply_feedback("bob", 4);
        let after = s.video_send_rate();
        assert!(after < before);
        assert!(after > 4, "blending keeps the pace above the raw proposal");
    }

    #[test]
    fn suggestions_cover_tracked_peers() {
        let s = session();
        assert!(s.video_rate_suggestions().is_empty());
        s.accept_unit(&unit(0, 1, 0xABCD), 2.0);
        let suggestions = s.video_rate_suggestions();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].0, "bob");
    }
}

//! Port traits for the external collaborators the protocol stack does not
//! own: capture devices, playback, and the presentation layer.
//!
//! Adapters and embedding applications implement these; the session engine
//! never references a concrete device or UI toolkit.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::domain::roster::{CallInfo, Medium, UserInfo, UserStatus};

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// One encoded frame from a capture device, ready for framing + encryption.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Bytes,
    /// Capture time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
}

/// A continuously-updating producer that always holds the latest frame.
///
/// Senders subscribe and read whatever is current instead of blocking on the
/// device: a depth-1, latest-value-wins channel. `None` until the device has
/// produced its first frame.
pub trait CaptureSource: Send + Sync {
    fn subscribe(&self, medium: Medium) -> watch::Receiver<Option<CapturedFrame>>;
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Accepts decrypted media payloads for decoding and playout.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn play_audio(&self, source: &str, payload: Bytes);
    /// Playback resources for a departed participant can be released.
    async fn remove_source(&self, source: &str);
}

// ---------------------------------------------------------------------------
// Presentation bridge
// ---------------------------------------------------------------------------

/// Events toward the rendering layer. It only renders; it never decides
/// protocol correctness.
#[async_trait]
pub trait UiEvents: Send + Sync {
    /// The local event-ingress endpoint is bound; the UI sends its commands
    /// here as datagrams.
    async fn ingress_ready(&self, port: u16);
    async fn join_result(&self, ok: bool, users: Vec<UserInfo>, calls: Vec<CallInfo>);
    async fn user_joined(&self, name: &str);
    async fn user_left(&self, name: &str);
    async fn user_status(&self, name: &str, status: UserStatus);
    async fn call_added(&self, info: CallInfo);
    async fn call_changed(&self, info: CallInfo);
    async fn call_removed(&self, master: &str);
    /// Someone wants us in a call; the UI should prompt.
    async fn participate_prompt(&self, caller: &str);
    /// Transient banner, e.g. "bob is unavailable". Auto-dismissed by the UI.
    async fn banner(&self, text: &str);
    async fn call_started(&self, info: CallInfo);
    async fn call_ended(&self);
    async fn chat_message(&self, source: &str, text: &str);
    /// A remote participant toggled a medium on or off.
    async fn media_state(&self, source: &str, medium: Medium, active: bool);
    async fn video_frame(&self, source: &str, data: Bytes);
}

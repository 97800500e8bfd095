//! Control-plane wire messages.
//!
//! Every message is one JSON object carrying a `type` tag and, inside each
//! category, a `subtype` tag. Objects are concatenated on the TCP control
//! stream and sent one-per-datagram on UDP channels; see
//! [`crate::adapters::codec`] for the streaming decoder.
//!
//! Pure data — no I/O.

use serde::{Deserialize, Serialize};

use super::roster::{CallInfo, Medium, UserInfo, UserStatus};

// ---------------------------------------------------------------------------
// Envelope: one enum per `type`, one nested enum per `subtype`
// ---------------------------------------------------------------------------

/// Top-level message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Join(JoinMsg),
    UserUpdate(UserUpdateMsg),
    Call(CallMsg),
    CallUpdate(CallUpdateMsg),
    Session(SessionMsg),
}

// ---------------------------------------------------------------------------
// join
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum JoinMsg {
    Request {
        name: String,
    },
    Response {
        status: JoinStatus,
        name: String,
        #[serde(default)]
        user_info_lst: Vec<UserInfo>,
        #[serde(default)]
        call_info_lst: Vec<CallInfo>,
    },
}

/// `ok` admits the user; `no` means an exact-name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Ok,
    No,
}

// ---------------------------------------------------------------------------
// user_update (server → all)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum UserUpdateMsg {
    Join { name: String },
    Leave { name: String },
    Status { name: String, status: UserStatus },
}

// ---------------------------------------------------------------------------
// call (call formation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum CallMsg {
    /// Client → server: ask to call `callee`.
    Request { callee: String },
    /// Server → callee: `caller` wants you in a call.
    Participate { caller: String },
    /// Callee → server, and server → caller on rejection.
    CalleeResponse { caller: String, status: CallResponse },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponse {
    Accept,
    Reject,
}

// ---------------------------------------------------------------------------
// call_update (server → entire directory)
// ---------------------------------------------------------------------------

/// Call roster changes. Broadcast to every user, not only participants, so
/// idle clients can render the call roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum CallUpdateMsg {
    CallAdd {
        master: String,
        info: CallInfo,
    },
    CallRemove {
        master: String,
    },
    UserJoin {
        master: String,
        name: String,
        info: CallInfo,
    },
    /// Also announces master migration: `info.master` is the (possibly new)
    /// master after `name` left.
    UserLeave {
        master: String,
        name: String,
        info: CallInfo,
    },
}

// ---------------------------------------------------------------------------
// session (in-call traffic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SessionMsg {
    /// Client → server: leave the current call.
    Leave,
    /// Encrypted media unit, base64 ciphertext of a serialized
    /// [`super::media::MediaUnit`].
    Content { medium: Medium, payload: String },
    Control(SessionControl),
}

/// In-call control datagrams and one-shot key-exchange messages, tagged by
/// `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionControl {
    /// Non-master → master over the one-shot key connection.
    Pubkey {
        name: String,
        /// Base64 X25519 public key (32 bytes).
        key: String,
    },
    /// Master → non-master reply: sealed `(call key ‖ session nonce)` plus the
    /// plaintext IV.
    KeyInfo { sealed: String, iv: String },
    /// Participant → master over the control multicast group: the optimal
    /// sending rate this participant measured for the master's video.
    Feedback { source: String, rate: u32 },
    /// Per-medium send-enabled announcement (mute/unmute, camera off).
    State {
        source: String,
        medium: Medium,
        active: bool,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

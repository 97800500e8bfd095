//! Headless stand-ins for the device and presentation ports.
//!
//! [`Autopilot`] renders events as log lines and, when configured, drives
//! the engine back through its own command ingress: dialing a peer after a
//! successful join and answering participate prompts. [`TestPatternSource`]
//! and [`SilentSink`] replace real capture and playout devices.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

use confab_core::adapters::codec;
use confab_core::application::ports::{CapturedFrame, CaptureSource, PlaybackSink, UiEvents};
use confab_core::domain::message::{CallMsg, CallResponse, Message};
use confab_core::domain::roster::{CallInfo, Medium, UserInfo, UserStatus};

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Presentation
// ---------------------------------------------------------------------------

pub struct Autopilot {
    /// Peer to dial once registered, if any.
    dial: Option<String>,
    /// Accept incoming participate prompts instead of rejecting them.
    auto_accept: bool,
    /// Command channel back into the engine, available after `ingress_ready`.
    cmd: Mutex<Option<(Arc<UdpSocket>, SocketAddr)>>,
}

impl Autopilot {
    pub fn new(dial: Option<String>, auto_accept: bool) -> Self {
        Self {
            dial,
            auto_accept,
            cmd: Mutex::new(None),
        }
    }

    async fn send_command(&self, msg: &Message) {
        let guard = self.cmd.lock().await;
        let Some((sock, addr)) = guard.as_ref() else {
            warn!("command ingress not ready; dropping command");
            return;
        };
        match codec::encode(msg) {
            Ok(bytes) => {
                if let Err(e) = sock.send_to(&bytes, *addr).await {
                    warn!("failed to send command: {e}");
                }
            }
            Err(e) => warn!("failed to encode command: {e}"),
        }
    }
}

#[async_trait]
impl UiEvents for Autopilot {
    async fn ingress_ready(&self, port: u16) {
        match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(sock) => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                *self.cmd.lock().await = Some((Arc::new(sock), addr));
                info!(port, "command ingress ready");
            }
            Err(e) => warn!("cannot bind command socket: {e}"),
        }
    }

    async fn join_result(&self, ok: bool, users: Vec<UserInfo>, calls: Vec<CallInfo>) {
        info!(ok, users = users.len(), calls = calls.len(), "join result");
        if !ok {
            return;
        }
        if let Some(callee) = &self.dial {
            info!(%callee, "dialing");
            self.send_command(&Message::Call(CallMsg::Request {
                callee: callee.clone(),
            }))
            .await;
        }
    }

    async fn user_joined(&self, name: &str) {
        info!(%name, "user joined the directory");
    }

    async fn user_left(&self, name: &str) {
        info!(%name, "user left the directory");
    }

    async fn user_status(&self, name: &str, status: UserStatus) {
        info!(%name, ?status, "user status changed");
    }

    async fn call_added(&self, info: CallInfo) {
        info!(master = %info.master, users = ?info.user_lst, "call added");
    }

    async fn call_changed(&self, info: CallInfo) {
        info!(master = %info.master, users = ?info.user_lst, "call roster changed");
    }

    async fn call_removed(&self, master: &str) {
        info!(%master, "call removed");
    }

    async fn participate_prompt(&self, caller: &str) {
        let status = if self.auto_accept {
            CallResponse::Accept
        } else {
            CallResponse::Reject
        };
        info!(%caller, ?status, "answering participate prompt");
        self.send_command(&Message::Call(CallMsg::CalleeResponse {
            caller: caller.to_string(),
            status,
        }))
        .await;
    }

    async fn banner(&self, text: &str) {
        info!("{text}");
    }

    async fn call_started(&self, info: CallInfo) {
        info!(master = %info.master, users = ?info.user_lst, "call started");
    }

    async fn call_ended(&self) {
        info!("call ended");
    }

    async fn chat_message(&self, source: &str, text: &str) {
        info!(%source, "chat: {text}");
    }

    async fn media_state(&self, source: &str, medium: Medium, active: bool) {
        info!(%source, ?medium, active, "remote media state");
    }

    async fn video_frame(&self, source: &str, data: Bytes) {
        trace!(%source, bytes = data.len(), "video frame");
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

const AUDIO_FRAME_PERIOD: Duration = Duration::from_millis(20);
const VIDEO_FRAME_PERIOD: Duration = Duration::from_millis(40);
const AUDIO_FRAME_LEN: usize = 160;
const VIDEO_FRAME_LEN: usize = 2048;

/// Synthetic capture device: steady audio blocks and numbered video frames.
pub struct TestPatternSource {
    audio: watch::Receiver<Option<CapturedFrame>>,
    video: watch::Receiver<Option<CapturedFrame>>,
    chat_tx: watch::Sender<Option<CapturedFrame>>,
}

impl TestPatternSource {
    pub fn start() -> Self {
        let (audio_tx, audio) = watch::channel(None);
        let (video_tx, video) = watch::channel(None);
        let (chat_tx, _) = watch::channel(None);

        tokio::spawn(pattern_loop(audio_tx, AUDIO_FRAME_PERIOD, AUDIO_FRAME_LEN));
        tokio::spawn(pattern_loop(video_tx, VIDEO_FRAME_PERIOD, VIDEO_FRAME_LEN));

        Self {
            audio,
            video,
            chat_tx,
        }
    }
}

async fn pattern_loop(tx: watch::Sender<Option<CapturedFrame>>, period: Duration, len: usize) {
    let mut counter: u64 = 0;
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let mut data = vec![(counter & 0xFF) as u8; len];
        data[..8].copy_from_slice(&counter.to_be_bytes());
        counter += 1;
        if tx
            .send(Some(CapturedFrame {
                data: Bytes::from(data),
                timestamp_us: now_us(),
            }))
            .is_err()
        {
            return; // nobody will ever subscribe again
        }
    }
}

impl CaptureSource for TestPatternSource {
    fn subscribe(&self, medium: Medium) -> watch::Receiver<Option<CapturedFrame>> {
        match medium {
            Medium::Audio => self.audio.clone(),
            Medium::Video => self.video.clone(),
            Medium::Chat => self.chat_tx.subscribe(),
        }
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Counts received audio instead of playing it.
#[derive(Default)]
pub struct SilentSink {
    frames: AtomicU64,
}

#[async_trait]
impl PlaybackSink for SilentSink {
    async fn play_audio(&self, source: &str, payload: Bytes) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 256 == 0 {
            debug!(%source, frames = n, bytes = payload.len(), "audio flowing");
        }
    }

    async fn remove_source(&self, source: &str) {
        debug!(%source, "playback source removed");
    }
}

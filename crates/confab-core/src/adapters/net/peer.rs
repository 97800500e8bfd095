//! Peer-side session engine.
//!
//! One task owns all connection state: the directory stream, the local UI
//! ingress socket, and — while a call is active — the chat and control
//! multicast sockets. Media hot paths live in [`super::workers`]; everything
//! else funnels through the `select!` loop here, with outbound traffic going
//! through the [`TaskQueue`] scanned once per iteration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::adapters::codec::{self, MessageDecoder};
use crate::adapters::crypto::{self, MediaCipher};
use crate::application::ports::{CaptureSource, PlaybackSink, UiEvents};
use crate::application::session::CallSession;
use crate::application::task_queue::{TaskDest, TaskQueue};
use crate::domain::media::MediaUnit;
use crate::domain::message::{
    CallMsg, CallResponse, CallUpdateMsg, JoinMsg, JoinStatus, Message, SessionControl,
    SessionMsg, UserUpdateMsg,
};
use crate::domain::roster::{CallInfo, Medium};

use super::workers;
use super::{ephemeral_udp, multicast_receiver, unix_now_s, unix_now_us};

/// How often the engine reports measured optimal rates to the call master.
const FEEDBACK_PERIOD: Duration =
    Duration::from_millis((crate::application::rate::FEEDBACK_INTERVAL * 1000.0) as u64);

/// How often the task queue is rescanned when the loop is otherwise idle.
const FLUSH_PERIOD: Duration = Duration::from_millis(50);

const MAX_RECV_SIZE: usize = 65_536;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Directory server control endpoint.
    pub server_addr: SocketAddr,
    /// Display name to register under. Must be unique in the directory.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Active call bookkeeping
// ---------------------------------------------------------------------------

struct ActiveCall {
    session: Arc<CallSession>,
    chat_sock: Arc<UdpSocket>,
    control_sock: Arc<UdpSocket>,
    /// Built lazily once the key handshake lands.
    cipher: Option<Arc<MediaCipher>>,
    /// The four media workers; awaited on teardown.
    workers: Vec<JoinHandle<()>>,
    /// Key listener / handshake tasks; aborted on teardown.
    aux: Vec<JoinHandle<()>>,
    has_key_listener: bool,
}

impl ActiveCall {
    fn cipher(&mut self) -> Option<Arc<MediaCipher>> {
        if self.cipher.is_none() {
            let keys = self.session.keys()?;
            match MediaCipher::new(&keys) {
                Ok(c) => self.cipher = Some(Arc::new(c)),
                Err(e) => {
                    warn!("unusable session keys: {e}");
                    return None;
                }
            }
        }
        self.cipher.clone()
    }
}

struct EngineState {
    server: Arc<TcpStream>,
    queue: TaskQueue,
    active: Option<ActiveCall>,
}

impl EngineState {
    fn send_server(&mut self, msg: &Message) {
        match codec::encode(msg) {
            Ok(bytes) => self
                .queue
                .push(TaskDest::Stream(Arc::clone(&self.server)), bytes),
            Err(e) => warn!("failed to encode directory message: {e}"),
        }
    }

    /// Queue one datagram toward a call channel (chat or control group).
    fn send_datagram(&mut self, socket: Arc<UdpSocket>, addr: SocketAddr, msg: &Message) {
        match codec::encode(msg) {
            Ok(bytes) => self.queue.push(TaskDest::Datagram { socket, addr }, bytes),
            Err(e) => warn!("failed to encode datagram: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PeerEngine {
    cfg: PeerConfig,
    capture: Arc<dyn CaptureSource>,
    playback: Arc<dyn PlaybackSink>,
    ui: Arc<dyn UiEvents>,
}

impl PeerEngine {
    pub fn new(
        cfg: PeerConfig,
        capture: Arc<dyn CaptureSource>,
        playback: Arc<dyn PlaybackSink>,
        ui: Arc<dyn UiEvents>,
    ) -> Self {
        Self {
            cfg,
            capture,
            playback,
            ui,
        }
    }

    /// Connect, register, and run the event loop until the directory
    /// connection closes or a fatal local error occurs.
    pub async fn run(self) -> anyhow::Result<()> {
        let server = Arc::new(TcpStream::connect(self.cfg.server_addr).await?);
        info!(addr = %self.cfg.server_addr, name = %self.cfg.name, "connected to directory");

        let ingress = Arc::new(ephemeral_udp().await?);
        self.ui.ingress_ready(ingress.local_addr()?.port()).await;

        let mut st = EngineState {
            server: Arc::clone(&server),
            queue: TaskQueue::new(),
            active: None,
        };
        st.send_server(&Message::Join(JoinMsg::Request {
            name: self.cfg.name.clone(),
        }));

        let mut decoder = MessageDecoder::new();
        let mut server_buf = vec![0u8; MAX_RECV_SIZE];

        let mut feedback = tokio::time::interval(FEEDBACK_PERIOD);
        feedback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut flush = tokio::time::interval(FLUSH_PERIOD);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'main: loop {
            let chat = st.active.as_ref().map(|a| Arc::clone(&a.chat_sock));
            let control = st.active.as_ref().map(|a| Arc::clone(&a.control_sock));

            tokio::select! {
                r = server.readable() => {
                    r?;
                    match server.try_read(&mut server_buf) {
                        Ok(0) => break 'main, // directory gone
                        Ok(n) => {
                            decoder.push(&server_buf[..n]);
                            loop {
                                match decoder.next() {
                                    Ok(Some(msg)) => self.handle_server_msg(&mut st, msg).await?,
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!("undecodable directory data: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                r = maybe_recv(Some(Arc::clone(&ingress))) => {
                    match r {
                        Ok((data, _)) => match codec::decode_datagram(&data) {
                            Ok(msg) => self.handle_ui_msg(&mut st, msg).await,
                            Err(e) => warn!("undecodable command: {e}"),
                        },
                        Err(e) => warn!("command socket error: {e}"),
                    }
                }
                r = maybe_recv(chat) => {
                    if let Ok((data, _)) = r {
                        self.handle_chat_datagram(&mut st, &data).await;
                    }
                }
                r = maybe_recv(control) => {
                    if let Ok((data, _)) = r {
                        self.handle_control_datagram(&mut st, &data).await;
                    }
                }
                _ = feedback.tick() => self.send_feedback(&mut st),
                _ = flush.tick() => {}
            }
            st.queue.drain();
        }

        info!("directory connection closed; shutting down");
        self.teardown(&mut st).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Directory stream
    // -----------------------------------------------------------------------

    async fn handle_server_msg(&self, st: &mut EngineState, msg: Message) -> anyhow::Result<()> {
        match msg {
            Message::Join(JoinMsg::Response {
                status,
                user_info_lst,
                call_info_lst,
                ..
            }) => {
                let ok = status == JoinStatus::Ok;
                if !ok {
                    warn!(name = %self.cfg.name, "name already registered");
                }
                self.ui.join_result(ok, user_info_lst, call_info_lst).await;
            }
            Message::UserUpdate(update) => match update {
                UserUpdateMsg::Join { name } => self.ui.user_joined(&name).await,
                UserUpdateMsg::Leave { name } => self.ui.user_left(&name).await,
                UserUpdateMsg::Status { name, status } => {
                    self.ui.user_status(&name, status).await
                }
            },
            Message::Call(CallMsg::Participate { caller }) => {
                self.ui.participate_prompt(&caller).await;
            }
            Message::Call(CallMsg::CalleeResponse {
                status: CallResponse::Reject,
                ..
            }) => {
                self.ui.banner("call declined").await;
            }
            Message::CallUpdate(update) => self.handle_call_update(st, update).await?,
            other => trace!(?other, "ignoring directory message"),
        }
        Ok(())
    }

    async fn handle_call_update(
        &self,
        st: &mut EngineState,
        update: CallUpdateMsg,
    ) -> anyhow::Result<()> {
        match update {
            CallUpdateMsg::CallAdd { master: _, info } => {
                if st.active.is_none() && self.in_roster(&info) {
                    self.start_call(st, info.clone()).await?;
                }
                self.ui.call_added(info).await;
            }
            CallUpdateMsg::UserJoin {
                master: _,
                name,
                info,
            } => {
                if st.active.is_none() && name == self.cfg.name {
                    self.start_call(st, info.clone()).await?;
                } else if let Some(active) = st.active.as_ref() {
                    if self.in_roster(&info) {
                        active.session.set_info(info.clone());
                    }
                }
                self.ui.call_changed(info).await;
            }
            CallUpdateMsg::UserLeave {
                master: _,
                name,
                info,
            } => {
                if let Some(active) = st.active.as_mut() {
                    if self.in_roster(&info) {
                        active.session.set_info(info.clone());
                        active.session.forget_peer(&name);
                        self.playback.remove_source(&name).await;

                        // Master migration: the promoted peer starts serving
                        // key exchanges with the keys it already holds.
                        if active.session.is_master() && !active.has_key_listener {
                            info!("promoted to call master");
                            active.aux.push(tokio::spawn(workers::key_listener(
                                Arc::clone(&active.session),
                            )));
                            active.has_key_listener = true;
                        }
                    }
                }
                self.ui.call_changed(info).await;
            }
            CallUpdateMsg::CallRemove { master } => {
                let ours = st
                    .active
                    .as_ref()
                    .is_some_and(|a| a.session.info().master == master);
                if ours {
                    self.teardown(st).await;
                }
                self.ui.call_removed(&master).await;
            }
        }
        Ok(())
    }

    fn in_roster(&self, info: &CallInfo) -> bool {
        info.user_lst.iter().any(|n| *n == self.cfg.name)
    }

    // -----------------------------------------------------------------------
    // UI commands (local ingress datagrams)
    // -----------------------------------------------------------------------

    async fn handle_ui_msg(&self, st: &mut EngineState, msg: Message) {
        match msg {
            // Directory-bound commands pass through unchanged.
            Message::Join(JoinMsg::Request { .. })
            | Message::Call(CallMsg::Request { .. })
            | Message::Call(CallMsg::CalleeResponse { .. }) => st.send_server(&msg),

            Message::Session(SessionMsg::Leave) => {
                st.send_server(&msg);
                self.teardown(st).await;
            }
            Message::Session(SessionMsg::Content {
                medium: Medium::Chat,
                payload,
            }) => self.send_chat(st, payload),
            Message::Session(SessionMsg::Control(SessionControl::State {
                medium, active, ..
            })) => {
                let Some(call) = st.active.as_ref() else {
                    return;
                };
                call.session.set_send_enabled(medium, active);
                let announce = Message::Session(SessionMsg::Control(SessionControl::State {
                    source: self.cfg.name.clone(),
                    medium,
                    active,
                }));
                let socket = Arc::clone(&call.control_sock);
                let addr = call.session.info().addrs.control();
                st.send_datagram(socket, addr, &announce);
            }
            other => debug!(?other, "unsupported command"),
        }
    }

    /// Frame, encrypt, and queue one chat line for the chat group.
    fn send_chat(&self, st: &mut EngineState, text: String) {
        let Some(call) = st.active.as_mut() else {
            debug!("chat outside a call");
            return;
        };
        if !call.session.send_enabled(Medium::Chat) {
            return;
        }
        let (Some(cipher), Some(keys)) = (call.cipher(), call.session.keys()) else {
            debug!("chat before key handshake; dropped");
            return;
        };

        let unit = MediaUnit {
            medium: Medium::Chat,
            seq: call.session.next_seq(Medium::Chat),
            session_nonce: keys.session_nonce,
            packet_nonce: rand::random(),
            source: self.cfg.name.clone(),
            timestamp_us: unix_now_us(),
            payload: text.into_bytes(),
        };
        match cipher.seal_unit(&unit) {
            Ok(payload) => {
                let msg = Message::Session(SessionMsg::Content {
                    medium: Medium::Chat,
                    payload,
                });
                let socket = Arc::clone(&call.chat_sock);
                let addr = call.session.info().addrs.content(Medium::Chat);
                st.send_datagram(socket, addr, &msg);
            }
            Err(e) => warn!("failed to seal chat line: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Call channels
    // -----------------------------------------------------------------------

    async fn handle_chat_datagram(&self, st: &mut EngineState, data: &[u8]) {
        let Some(call) = st.active.as_mut() else {
            return;
        };
        let Some(cipher) = call.cipher() else {
            return;
        };
        let Some(unit) = workers::open_content(&cipher, data, Medium::Chat) else {
            return;
        };
        if !call.session.accept_unit(&unit, unix_now_s()) {
            return;
        }
        let text = String::from_utf8_lossy(&unit.payload).into_owned();
        self.ui.chat_message(&unit.source, &text).await;
    }

    async fn handle_control_datagram(&self, st: &mut EngineState, data: &[u8]) {
        let Some(call) = st.active.as_ref() else {
            return;
        };
        let msg = match codec::decode_datagram(data) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("undecodable control datagram: {e}");
                return;
            }
        };
        let Message::Session(SessionMsg::Control(ctl)) = msg else {
            return;
        };
        match ctl {
            SessionControl::Feedback { source, rate } => {
                // Only the master adapts, and never from its own loopback.
                if source != self.cfg.name && call.session.is_master() {
                    call.session.apply_feedback(&source, rate);
                }
            }
            SessionControl::State {
                source,
                medium,
                active,
            } => {
                if source != self.cfg.name {
                    self.ui.media_state(&source, medium, active).await;
                }
            }
            other => trace!(?other, "unexpected control-group message"),
        }
    }

    /// Report the optimal rate measured for the master's video stream.
    fn send_feedback(&self, st: &mut EngineState) {
        let Some(call) = st.active.as_ref() else {
            return;
        };
        let info = call.session.info();
        if info.master == self.cfg.name || !call.session.has_keys() {
            return;
        }
        let Some((_, rate)) = call
            .session
            .video_rate_suggestions()
            .into_iter()
            .find(|(peer, _)| *peer == info.master)
        else {
            return;
        };

        let msg = Message::Session(SessionMsg::Control(SessionControl::Feedback {
            source: self.cfg.name.clone(),
            rate,
        }));
        let socket = Arc::clone(&call.control_sock);
        st.send_datagram(socket, info.addrs.control(), &msg);
    }

    // -----------------------------------------------------------------------
    // Call lifecycle
    // -----------------------------------------------------------------------

    async fn start_call(&self, st: &mut EngineState, info: CallInfo) -> anyhow::Result<()> {
        let addrs = info.addrs;
        let audio_sock = Arc::new(multicast_receiver(addrs.content(Medium::Audio))?);
        let video_sock = Arc::new(multicast_receiver(addrs.content(Medium::Video))?);
        let chat_sock = Arc::new(multicast_receiver(addrs.content(Medium::Chat))?);
        let control_sock = Arc::new(multicast_receiver(addrs.control())?);

        let session = Arc::new(CallSession::new(self.cfg.name.clone(), info.clone()));

        let mut aux = Vec::new();
        let has_key_listener = session.is_master();
        if has_key_listener {
            session.set_keys(crypto::generate_call_secrets());
            aux.push(tokio::spawn(workers::key_listener(Arc::clone(&session))));
        } else {
            aux.push(tokio::spawn(workers::key_handshake(
                Arc::clone(&session),
                self.cfg.name.clone(),
            )));
        }

        let workers = vec![
            tokio::spawn(workers::audio_send(
                Arc::clone(&session),
                Arc::clone(&audio_sock),
                addrs.content(Medium::Audio),
                Arc::clone(&self.capture),
            )),
            tokio::spawn(workers::audio_recv(
                Arc::clone(&session),
                audio_sock,
                Arc::clone(&self.playback),
            )),
            tokio::spawn(workers::video_send(
                Arc::clone(&session),
                Arc::clone(&video_sock),
                addrs.content(Medium::Video),
                Arc::clone(&self.capture),
            )),
            tokio::spawn(workers::video_recv(
                Arc::clone(&session),
                video_sock,
                Arc::clone(&self.ui),
            )),
        ];

        info!(master = %info.master, users = ?info.user_lst, "call session up");
        st.active = Some(ActiveCall {
            session,
            chat_sock,
            control_sock,
            cipher: None,
            workers,
            aux,
            has_key_listener,
        });
        self.ui.call_started(info).await;
        Ok(())
    }

    /// Stop workers, release per-peer playback, and drop the call state.
    /// Media workers notice the stop flag within a second and are awaited;
    /// the key tasks are plain aborts.
    async fn teardown(&self, st: &mut EngineState) {
        let Some(call) = st.active.take() else {
            return;
        };
        call.session.request_stop();
        for task in call.aux {
            task.abort();
        }
        for task in call.workers {
            let _ = task.await;
        }
        for peer in call.session.remote_peers() {
            self.playback.remove_source(&peer).await;
        }
        info!("call session down");
        self.ui.call_ended().await;
    }
}

// ---------------------------------------------------------------------------
// Select helpers
// ---------------------------------------------------------------------------

/// Receive one datagram, or park forever when the socket is absent. Lets the
/// call channels share `select!` arms whether or not a call is active.
async fn maybe_recv(sock: Option<Arc<UdpSocket>>) -> std::io::Result<(Vec<u8>, SocketAddr)> {
    match sock {
        Some(sock) => {
            let mut buf = vec![0u8; MAX_RECV_SIZE];
            let (n, addr) = sock.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok((buf, addr))
        }
        None => std::future::pending().await,
    }
}

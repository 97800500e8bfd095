//! In-call worker tasks: media send/receive loops and the key exchange.
//!
//! Every loop polls [`CallSession::is_running`] at least once per second, so
//! teardown converges without cancellation. Workers wait for key material
//! before touching the wire; until the handshake lands there is nothing they
//! could encrypt or decrypt.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::adapters::codec::{self, MessageDecoder};
use crate::adapters::crypto::{self, MediaCipher};
use crate::application::ports::{CaptureSource, PlaybackSink, UiEvents};
use crate::application::session::CallSession;
use crate::domain::media::MediaUnit;
use crate::domain::message::{Message, SessionControl, SessionMsg};
use crate::domain::roster::{Medium, KEY_EXCHANGE_PORT};

use super::unix_now_s;

/// Upper bound on every blocking wait inside a worker loop; the stop flag is
/// re-checked at this cadence.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between key handshake attempts while the master is not reachable yet.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(500);

const MAX_RECV_SIZE: usize = 65_536;

/// Depth of the per-peer playback channel. Audio playout is realtime; a stall
/// drops frames rather than building delay.
const PLAYER_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Block until the session keys arrive, then build the media cipher.
/// `None` when the call stops first.
async fn wait_for_cipher(session: &CallSession) -> Option<(MediaCipher, u64)> {
    loop {
        if let Some(keys) = session.keys() {
            match MediaCipher::new(&keys) {
                Ok(cipher) => return Some((cipher, keys.session_nonce)),
                Err(e) => {
                    warn!("unusable session keys: {e}");
                    return None;
                }
            }
        }
        if !session.is_running() {
            return None;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

/// Frame, encrypt, and multicast one captured payload.
async fn send_unit(
    session: &CallSession,
    cipher: &MediaCipher,
    session_nonce: u64,
    sock: &UdpSocket,
    group: SocketAddr,
    medium: Medium,
    data: Bytes,
    timestamp_us: u64,
) {
    let unit = MediaUnit {
        medium,
        seq: session.next_seq(medium),
        session_nonce,
        packet_nonce: rand::random(),
        source: session.local_name.clone(),
        timestamp_us,
        payload: data.to_vec(),
    };
    let payload = match cipher.seal_unit(&unit) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to seal {medium:?} unit: {e}");
            return;
        }
    };
    let msg = Message::Session(SessionMsg::Content { medium, payload });
    match codec::encode(&msg) {
        Ok(bytes) => {
            if let Err(e) = sock.send_to(&bytes, group).await {
                debug!("{medium:?} send failed: {e}");
            }
        }
        Err(e) => warn!("failed to encode {medium:?} envelope: {e}"),
    }
}

/// Decode a content envelope for `medium` and decrypt the unit inside.
/// Anything else on the socket is dropped quietly.
pub(crate) fn open_content(cipher: &MediaCipher, data: &[u8], medium: Medium) -> Option<MediaUnit> {
    let msg = match codec::decode_datagram(data) {
        Ok(msg) => msg,
        Err(e) => {
            trace!("undecodable {medium:?} datagram: {e}");
            return None;
        }
    };
    let Message::Session(SessionMsg::Content {
        medium: got,
        payload,
    }) = msg
    else {
        return None;
    };
    if got != medium {
        return None;
    }
    match cipher.open_unit(&payload) {
        Ok(unit) => Some(unit),
        Err(e) => {
            trace!("dropping {medium:?} unit: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Forward every fresh capture frame to the audio group.
pub async fn audio_send(
    session: Arc<CallSession>,
    sock: Arc<UdpSocket>,
    group: SocketAddr,
    capture: Arc<dyn CaptureSource>,
) {
    let Some((cipher, session_nonce)) = wait_for_cipher(&session).await else {
        return;
    };
    let mut rx = capture.subscribe(Medium::Audio);

    while session.is_running() {
        match timeout(POLL_TIMEOUT, rx.changed()).await {
            Err(_) => continue,   // idle device; re-check the stop flag
            Ok(Err(_)) => break,  // capture side gone
            Ok(Ok(())) => {}
        }
        if !session.send_enabled(Medium::Audio) {
            continue;
        }
        let Some(frame) = rx.borrow_and_update().clone() else {
            continue;
        };
        send_unit(
            &session,
            &cipher,
            session_nonce,
            &sock,
            group,
            Medium::Audio,
            frame.data,
            frame.timestamp_us,
        )
        .await;
    }
    debug!("audio send worker stopped");
}

/// Receive, vet, and fan incoming audio out to per-peer playback tasks.
pub async fn audio_recv(
    session: Arc<CallSession>,
    sock: Arc<UdpSocket>,
    playback: Arc<dyn PlaybackSink>,
) {
    let Some((cipher, _)) = wait_for_cipher(&session).await else {
        return;
    };
    let mut players: HashMap<String, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; MAX_RECV_SIZE];

    while session.is_running() {
        prune_players(&session, &mut players);

        let Ok(res) = timeout(POLL_TIMEOUT, sock.recv_from(&mut buf)).await else {
            continue;
        };
        let (n, _) = match res {
            Ok(pair) => pair,
            Err(e) => {
                debug!("audio socket error: {e}");
                break;
            }
        };
        let Some(unit) = open_content(&cipher, &buf[..n], Medium::Audio) else {
            continue;
        };
        if !session.accept_unit(&unit, unix_now_s()) {
            continue;
        }

        let tx = players
            .entry(unit.source.clone())
            .or_insert_with(|| spawn_player(unit.source.clone(), Arc::clone(&playback)));
        // Realtime playout: a full channel means we drop, not queue.
        let _ = tx.try_send(Bytes::from(unit.payload));
    }
    debug!("audio receive worker stopped");
}

/// Dedicated playout task for one remote speaker.
fn spawn_player(source: String, playback: Arc<dyn PlaybackSink>) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(PLAYER_DEPTH);
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            playback.play_audio(&source, payload).await;
        }
        playback.remove_source(&source).await;
    });
    tx
}

/// Drop playback channels for peers no longer in the call; their playout
/// tasks finish when the channel closes.
fn prune_players(session: &CallSession, players: &mut HashMap<String, mpsc::Sender<Bytes>>) {
    if players.is_empty() {
        return;
    }
    let current = session.remote_peers();
    players.retain(|name, _| current.iter().any(|n| n == name));
}

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

/// Send the latest captured video frame at the session's live pace.
///
/// The pace follows the master's adaptive rate; between ticks the capture
/// side may overwrite the slot many times and only the newest frame goes out.
pub async fn video_send(
    session: Arc<CallSession>,
    sock: Arc<UdpSocket>,
    group: SocketAddr,
    capture: Arc<dyn CaptureSource>,
) {
    let Some((cipher, session_nonce)) = wait_for_cipher(&session).await else {
        return;
    };
    let mut rx = capture.subscribe(Medium::Video);

    while session.is_running() {
        let period = Duration::from_secs_f64(1.0 / f64::from(session.video_send_rate()));
        sleep(period.min(POLL_TIMEOUT)).await;

        if !session.send_enabled(Medium::Video) {
            continue;
        }
        match rx.has_changed() {
            Ok(false) => continue, // no new frame since last tick
            Ok(true) => {}
            Err(_) => break, // capture side gone
        }
        let Some(frame) = rx.borrow_and_update().clone() else {
            continue;
        };
        send_unit(
            &session,
            &cipher,
            session_nonce,
            &sock,
            group,
            Medium::Video,
            frame.data,
            frame.timestamp_us,
        )
        .await;
    }
    debug!("video send worker stopped");
}

/// Receive and vet incoming video, forwarding frames to the renderer.
pub async fn video_recv(session: Arc<CallSession>, sock: Arc<UdpSocket>, ui: Arc<dyn UiEvents>) {
    let Some((cipher, _)) = wait_for_cipher(&session).await else {
        return;
    };
    let mut buf = vec![0u8; MAX_RECV_SIZE];

    while session.is_running() {
        let Ok(res) = timeout(POLL_TIMEOUT, sock.recv_from(&mut buf)).await else {
            continue;
        };
        let (n, _) = match res {
            Ok(pair) => pair,
            Err(e) => {
                debug!("video socket error: {e}");
                break;
            }
        };
        let Some(unit) = open_content(&cipher, &buf[..n], Medium::Video) else {
            continue;
        };
        if !session.accept_unit(&unit, unix_now_s()) {
            continue;
        }
        ui.video_frame(&unit.source, Bytes::from(unit.payload)).await;
    }
    debug!("video receive worker stopped");
}

// ---------------------------------------------------------------------------
// Key exchange
// ---------------------------------------------------------------------------

/// Master side: answer one-shot key connections for the lifetime of the call.
///
/// Also spawned on an existing participant when master migration promotes it;
/// the session keys are already present in that case.
pub async fn key_listener(session: Arc<CallSession>) {
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, KEY_EXCHANGE_PORT)).await {
        Ok(l) => l,
        Err(e) => {
            warn!("cannot bind key listener on {KEY_EXCHANGE_PORT}: {e}");
            return;
        }
    };
    info!(port = KEY_EXCHANGE_PORT, "key listener up");

    while session.is_running() {
        let Ok(res) = timeout(POLL_TIMEOUT, listener.accept()).await else {
            continue;
        };
        let (stream, addr) = match res {
            Ok(pair) => pair,
            Err(e) => {
                warn!("key listener accept failed: {e}");
                break;
            }
        };
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = serve_key_exchange(session, stream).await {
                debug!("key exchange with {addr} failed: {e}");
            }
        });
    }
    debug!("key listener stopped");
}

async fn serve_key_exchange(session: Arc<CallSession>, mut stream: TcpStream) -> anyhow::Result<()> {
    let msg = read_message(&mut stream).await?;
    let Message::Session(SessionMsg::Control(SessionControl::Pubkey { name, key })) = msg else {
        anyhow::bail!("expected a pubkey message");
    };
    let keys = session
        .keys()
        .ok_or_else(|| anyhow::anyhow!("no session keys to distribute"))?;

    let (sealed, iv) = crypto::seal_keys(&keys, &key)?;
    let reply = Message::Session(SessionMsg::Control(SessionControl::KeyInfo { sealed, iv }));
    stream.write_all(&codec::encode(&reply)?).await?;
    info!(peer = %name, "session keys delivered");
    Ok(())
}

/// Non-master side: fetch the session keys from the master, retrying until
/// they land or the call stops. Re-reads the key endpoint each attempt so a
/// master migration mid-handshake is picked up.
pub async fn key_handshake(session: Arc<CallSession>, local_name: String) {
    while session.is_running() && !session.has_keys() {
        let key_addr = session.info().key_addr;
        match try_handshake(key_addr, &local_name).await {
            Ok(keys) => {
                session.set_keys(keys);
                info!(master = %session.info().master, "key handshake complete");
                return;
            }
            Err(e) => {
                debug!(%key_addr, "key handshake attempt failed: {e}");
                sleep(HANDSHAKE_RETRY).await;
            }
        }
    }
}

async fn try_handshake(
    key_addr: SocketAddr,
    local_name: &str,
) -> anyhow::Result<crate::application::session::SessionKeys> {
    let mut stream = timeout(POLL_TIMEOUT, TcpStream::connect(key_addr)).await??;
    let keypair = crypto::HandshakeKeypair::generate();

    let hello = Message::Session(SessionMsg::Control(SessionControl::Pubkey {
        name: local_name.to_string(),
        key: keypair.public_b64(),
    }));
    stream.write_all(&codec::encode(&hello)?).await?;

    let reply = timeout(POLL_TIMEOUT, read_message(&mut stream)).await??;
    let Message::Session(SessionMsg::Control(SessionControl::KeyInfo { sealed, iv })) = reply
    else {
        anyhow::bail!("expected a key_info reply");
    };
    keypair.unseal_keys(&sealed, &iv)
}

/// Read exactly one message from a short-lived stream.
async fn read_message(stream: &mut TcpStream) -> anyhow::Result<Message> {
    let mut decoder = MessageDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(msg) = decoder.next()? {
            return Ok(msg);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-exchange");
        }
        decoder.push(&buf[..n]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

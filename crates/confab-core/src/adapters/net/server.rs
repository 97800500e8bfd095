//! Directory server event loop.
//!
//! Accepts control connections, decodes concatenated JSON messages per
//! connection, and funnels every event into a single dispatcher task that
//! owns the [`Registry`] — the registry's sole mutator. Outbound traffic goes
//! through the [`TaskQueue`], scanned once per loop iteration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::codec::{self, MessageDecoder};
use crate::application::registry::{ConnCtx, ConnId, Directive, Registry};
use crate::application::task_queue::{TaskDest, TaskQueue};
use crate::domain::message::Message;

/// How often the dispatcher rescans the task queue when idle.
const FLUSH_PERIOD: Duration = Duration::from_millis(50);

const MAX_RECV_SIZE: usize = 65_536;

// ---------------------------------------------------------------------------
// Events from connection readers
// ---------------------------------------------------------------------------

enum ServerEvent {
    Connected {
        ctx: ConnCtx,
        stream: Arc<TcpStream>,
    },
    Inbound {
        ctx: ConnCtx,
        msg: Message,
    },
    Closed {
        id: ConnId,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct DirectoryServer {
    listener: TcpListener,
}

impl DirectoryServer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "directory server listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop and the registry dispatcher until failure.
    pub async fn run(self) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<ServerEvent>(256);

        let accept = tokio::spawn(accept_loop(self.listener, tx));
        dispatch_loop(rx).await;
        accept.abort();
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<ServerEvent>) {
    let mut next_id: ConnId = 1;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let ctx = ConnCtx { id: next_id, addr };
        next_id += 1;
        debug!(conn = ctx.id, %addr, "connection accepted");

        let stream = Arc::new(stream);
        if tx
            .send(ServerEvent::Connected {
                ctx,
                stream: Arc::clone(&stream),
            })
            .await
            .is_err()
        {
            return; // dispatcher gone
        }
        tokio::spawn(read_loop(ctx, stream, tx.clone()));
    }
}

/// Per-connection reader: drain readable bytes, stream-decode, forward.
async fn read_loop(ctx: ConnCtx, stream: Arc<TcpStream>, tx: mpsc::Sender<ServerEvent>) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; MAX_RECV_SIZE];

    'conn: loop {
        if stream.readable().await.is_err() {
            break;
        }
        match stream.try_read(&mut buf) {
            Ok(0) => break, // orderly close
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(msg)) => {
                            if tx.send(ServerEvent::Inbound { ctx, msg }).await.is_err() {
                                break 'conn;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(conn = ctx.id, "undecodable control data: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                debug!(conn = ctx.id, "read error: {e}");
                break;
            }
        }
    }
    let _ = tx.send(ServerEvent::Closed { id: ctx.id }).await;
}

/// The single mutator of registry state.
async fn dispatch_loop(mut rx: mpsc::Receiver<ServerEvent>) {
    let mut registry = Registry::new();
    let mut conns: HashMap<ConnId, Arc<TcpStream>> = HashMap::new();
    let mut queue = TaskQueue::new();

    let mut flush = tokio::time::interval(FLUSH_PERIOD);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ServerEvent::Connected { ctx, stream } => {
                        conns.insert(ctx.id, stream);
                    }
                    ServerEvent::Inbound { ctx, msg } => {
                        let directives = registry.handle_message(ctx, msg);
                        enqueue(&registry, &conns, &mut queue, directives);
                    }
                    ServerEvent::Closed { id } => {
                        let directives = registry.disconnect(id);
                        conns.remove(&id);
                        enqueue(&registry, &conns, &mut queue, directives);
                    }
                }
            }
            _ = flush.tick() => {}
        }
        queue.drain();
    }
}

fn enqueue(
    registry: &Registry,
    conns: &HashMap<ConnId, Arc<TcpStream>>,
    queue: &mut TaskQueue,
    directives: Vec<Directive>,
) {
    for directive in directives {
        let payload = match codec::encode(&directive.msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode outbound message: {e}");
                continue;
            }
        };
        for conn_id in registry.resolve(directive.to) {
            if let Some(stream) = conns.get(&conn_id) {
                queue.push(TaskDest::Stream(Arc::clone(stream)), payload.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

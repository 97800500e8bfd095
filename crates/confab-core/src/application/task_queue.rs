//! Outbound task queue.
//!
//! A [`Task`] pairs a destination with a fully serialized message. The owning
//! event loop scans the queue once per iteration and delivers whatever is
//! currently writable; a task leaves the queue only after a successful send.
//! Destinations that stay unwritable keep their tasks queued, up to a bounded
//! number of scan attempts.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tracing::warn;

/// A task survives this many failed delivery scans before being dropped.
pub const MAX_ATTEMPTS: u32 = 64;

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Where a task's payload goes.
#[derive(Debug, Clone)]
pub enum TaskDest {
    /// A control stream; bytes are appended to the stream.
    Stream(Arc<TcpStream>),
    /// A datagram endpoint with an explicit destination address.
    Datagram {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One queued (destination, payload) pair. Immutable once queued, except for
/// consuming already-written bytes of a partially sent stream payload.
#[derive(Debug)]
pub struct Task {
    dest: TaskDest,
    payload: Bytes,
    attempts: u32,
    /// Some bytes already reached the stream; the remainder must follow
    /// before anything else may be written there.
    partially_sent: bool,
}

enum SendOutcome {
    Sent,
    /// Destination not writable right now (or stream partially written).
    Keep,
    /// Destination is gone; retrying is pointless.
    Dead,
}

impl Task {
    fn try_send(&mut self) -> SendOutcome {
        match &self.dest {
            TaskDest::Stream(stream) => loop {
                match stream.try_write(&self.payload) {
                    Ok(n) if n == self.payload.len() => return SendOutcome::Sent,
                    Ok(n) => {
                        // Partial write: keep the rest for the next scan.
                        self.payload = self.payload.slice(n..);
                        self.partially_sent = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return SendOutcome::Keep;
                    }
                    Err(_) => return SendOutcome::Dead,
                }
            },
            TaskDest::Datagram { socket, addr } => match socket.try_send_to(&self.payload, *addr)
            {
                Ok(_) => SendOutcome::Sent,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => SendOutcome::Keep,
                Err(_) => SendOutcome::Dead,
            },
        }
    }

    /// Identity of the stream this task writes to, if it is a stream task.
    fn stream_id(&self) -> Option<usize> {
        match &self.dest {
            TaskDest::Stream(stream) => Some(Arc::as_ptr(stream) as usize),
            TaskDest::Datagram { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dest: TaskDest, payload: Bytes) {
        self.tasks.push_back(Task {
            dest,
            payload,
            attempts: 0,
            partially_sent: false,
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Scan the queue once, sending every task whose destination is writable.
    /// Returns the number of tasks delivered.
    ///
    /// Stream tasks to the same stream stay strictly ordered: once a task for
    /// a stream is kept (unwritable or half-written), every later task for
    /// that stream is kept untouched in this scan. Writing a later object
    /// around a half-written one would splice bytes mid-object and desync the
    /// receiving decoder.
    pub fn drain(&mut self) -> usize {
        let mut sent = 0;
        let mut keep = VecDeque::with_capacity(self.tasks.len());
        let mut blocked_streams: Vec<usize> = Vec::new();

        while let Some(mut task) = self.tasks.pop_front() {
            if let Some(id) = task.stream_id() {
                if blocked_streams.contains(&id) {
                    // Not an attempt; the stream is simply busy this scan.
                    keep.push_back(task);
                    continue;
                }
            }
            match task.try_send() {
                SendOutcome::Sent => sent += 1,
                SendOutcome::Keep => {
                    if let Some(id) = task.stream_id() {
                        blocked_streams.push(id);
                    }
                    task.attempts += 1;
                    // A half-written object must never be dropped: the stream
                    // already carries its prefix.
                    if task.attempts >= MAX_ATTEMPTS && !task.partially_sent {
                        warn!(attempts = task.attempts, "dropping undeliverable task");
                    } else {
                        keep.push_back(task);
                    }
                }
                SendOutcome::Dead => {
                    warn!("dropping task for closed destination");
                }
            }
        }

        self.tasks = keep;
        sent
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn stream_pair() -> (Arc<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(client), server)
    }

    #[tokio::test]
    async fn delivers_stream_tasks_in_order() {
        let (client, mut server) = stream_pair().await;
        let mut queue = TaskQueue::new();
        queue.push(TaskDest::Stream(client.clone()), Bytes::from_static(b"one"));
        queue.push(TaskDest::Stream(client.clone()), Bytes::from_static(b"two"));

        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"onetwo");
    }

    #[tokio::test]
    async fn delivers_datagram_tasks() {
        let rx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        // try_send_to reports WouldBlock until the runtime has observed the
        // socket's writable readiness once; wait for that before draining.
        tx.writable().await.unwrap();
        let mut queue = TaskQueue::new();
        queue.push(
            TaskDest::Datagram {
                socket: tx,
                addr: rx.local_addr().unwrap(),
            },
            Bytes::from_static(b"ping"),
        );
        assert_eq!(queue.drain(), 1);

        let mut buf = [0u8; 16];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn later_task_never_overtakes_a_half_written_one() {
        let (client, mut server) = stream_pair().await;
        let mut queue = TaskQueue::new();

        // Large enough to overflow the socket send buffer so the first task
        // is left half-written after the first scan.
        let big = Bytes::from(vec![b'a'; 4 * 1024 * 1024]);
        let small = Bytes::from_static(b"bbbb");
        let expected_len = big.len() + small.len();
        queue.push(TaskDest::Stream(client.clone()), big.clone());
        queue.push(TaskDest::Stream(client.clone()), small.clone());

        let reader = tokio::spawn(async move {
            let mut out = Vec::with_capacity(expected_len);
            let mut buf = [0u8; 64 * 1024];
            while out.len() < expected_len {
                let n = server.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed early");
                out.extend_from_slice(&buf[..n]);
            }
            out
        });

        while !queue.is_empty() {
            queue.drain();
            tokio::task::yield_now().await;
        }

        let got = reader.await.unwrap();
        assert_eq!(&got[..big.len()], &big[..], "first payload must arrive whole");
        assert_eq!(&got[big.len()..], &small[..], "second payload must follow, not interleave");
    }

    #[tokio::test]
    async fn closed_destination_drops_task() {
        let (client, server) = stream_pair().await;
        drop(server);
        // Give the peer close a moment to propagate.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut queue = TaskQueue::new();
        // First write after close may still land in the send buffer; push a
        // couple so at least one hits the dead connection.
        for _ in 0..4 {
            queue.push(TaskDest::Stream(client.clone()), Bytes::from_static(b"x"));
            queue.drain();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(queue.is_empty(), "tasks for a dead stream must not linger");
    }
}

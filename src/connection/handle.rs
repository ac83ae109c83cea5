//! Handle for a single relayed TCP connection.
//!
//! A handle owns both halves of the accepted socket. `start` spawns a
//! reader task (the receive loop) and a writer task draining the outbound
//! channel. Either the root shutdown signal or the handle-local one stops
//! both tasks; `dispose` waits a bounded time for them to end and aborts
//! them past the bound.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::RelayConfig;
use crate::connection::ConnectionId;
use crate::encoding::TextEncoding;
use crate::relay::RelayEvent;

pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    encoding: TextEncoding,
    outbound: mpsc::Sender<Vec<u8>>,
    started: AtomicBool,
    disposed: AtomicBool,
    /// Handle-local shutdown. Set by `dispose`, by the reader when the
    /// peer goes away, and observed by `closed`.
    local_shutdown: watch::Sender<bool>,
    tasks: Mutex<TaskState>,
}

/// Socket halves and channel ends held between `new` and `start`.
struct PendingIo {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    root_shutdown: watch::Receiver<bool>,
    inbound: mpsc::Sender<RelayEvent>,
    read_chunk_size: usize,
}

#[derive(Default)]
struct TaskState {
    pending: Option<PendingIo>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: &RelayConfig,
        root_shutdown: watch::Receiver<bool>,
        inbound: mpsc::Sender<RelayEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer);
        let (local_shutdown, _) = watch::channel(false);

        Self {
            id,
            peer_addr,
            connected_at: Utc::now(),
            encoding: config.encoding,
            outbound,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            local_shutdown,
            tasks: Mutex::new(TaskState {
                pending: Some(PendingIo {
                    read_half,
                    write_half,
                    outbound_rx,
                    root_shutdown,
                    inbound,
                    read_chunk_size: config.read_chunk_size,
                }),
                reader: None,
                writer: None,
            }),
        }
    }

    /// Spawn the receive loop and writer task. Exactly-once: later calls
    /// are no-ops. Never blocks the caller.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap();
        let Some(io) = tasks.pending.take() else {
            return;
        };

        tasks.reader = Some(tokio::spawn(run_reader(
            self.id,
            io.read_half,
            io.read_chunk_size,
            self.encoding,
            io.inbound,
            io.root_shutdown,
            self.local_shutdown.subscribe(),
            self.local_shutdown.clone(),
        )));
        tasks.writer = Some(tokio::spawn(run_writer(
            self.id,
            io.write_half,
            io.outbound_rx,
            self.local_shutdown.subscribe(),
        )));

        tracing::debug!(connection_id = %self.id, peer = %self.peer_addr, "Connection started");
    }

    /// Queue encoded text for the peer. Fire-and-forget: the caller gets
    /// no delivery confirmation and a full outbound channel drops the
    /// chunk. The error is only used by the dispatcher for accounting.
    pub fn send(&self, text: &str) -> Result<(), TrySendError<Vec<u8>>> {
        self.outbound.try_send(self.encoding.encode(text))
    }

    /// Tear the connection down. Idempotent from any task: the first
    /// caller signals both tasks, waits up to `join_timeout` for each and
    /// aborts whatever is still running. Returns true if a task had to be
    /// aborted.
    pub async fn dispose(&self, join_timeout: Duration) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        // send_replace stores the value even when no task is listening yet.
        self.local_shutdown.send_replace(true);

        let (pending, reader, writer) = {
            let mut tasks = self.tasks.lock().unwrap();
            (tasks.pending.take(), tasks.reader.take(), tasks.writer.take())
        };
        // Never started: dropping the halves closes the socket.
        drop(pending);

        // Both joins run against the same timeout window: two stuck tasks
        // must not stack up to twice the configured bound.
        let (reader_forced, writer_forced) = tokio::join!(
            join_or_abort(self.id, "reader", reader, join_timeout),
            join_or_abort(self.id, "writer", writer, join_timeout),
        );
        let forced = reader_forced || writer_forced;

        tracing::debug!(connection_id = %self.id, forced, "Connection disposed");
        forced
    }

    /// Resolves once the connection has stopped, whether by disposal, by
    /// the peer hanging up or by a receive-loop failure.
    pub async fn closed(&self) {
        let mut rx = self.local_shutdown.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

async fn join_or_abort(
    id: ConnectionId,
    name: &str,
    task: Option<JoinHandle<()>>,
    join_timeout: Duration,
) -> bool {
    let Some(mut task) = task else {
        return false;
    };
    if task.is_finished() {
        return false;
    }
    match timeout(join_timeout, &mut task).await {
        Ok(_) => false,
        Err(_) => {
            tracing::warn!(
                connection_id = %id,
                task = name,
                timeout_ms = join_timeout.as_millis() as u64,
                "Task did not stop within the join timeout, aborting"
            );
            task.abort();
            true
        }
    }
}

/// Receive loop: each read of up to `read_chunk_size` bytes is decoded and
/// relayed as one discrete message. Exit conditions are checked at the top
/// of every iteration.
#[allow(clippy::too_many_arguments)]
async fn run_reader(
    id: ConnectionId,
    mut read_half: OwnedReadHalf,
    read_chunk_size: usize,
    encoding: TextEncoding,
    inbound: mpsc::Sender<RelayEvent>,
    mut root_shutdown: watch::Receiver<bool>,
    mut local_shutdown: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
) {
    let mut buf = vec![0u8; read_chunk_size];

    loop {
        if *root_shutdown.borrow() || *local_shutdown.borrow() {
            break;
        }

        tokio::select! {
            // A closed signal channel means the server itself is gone.
            res = root_shutdown.changed() => if res.is_err() { break; },
            res = local_shutdown.changed() => if res.is_err() { break; },
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!(connection_id = %id, "Peer closed connection");
                    break;
                }
                Ok(n) => {
                    // Decode exactly the bytes read, not the whole buffer.
                    let text = encoding.decode(&buf[..n]);
                    if inbound.send(RelayEvent::new(id, text)).await.is_err() {
                        tracing::debug!(connection_id = %id, "Dispatcher gone, stopping receive loop");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection_id = %id, error = %e, "Receive loop read failed");
                    break;
                }
            }
        }
    }

    // Whatever ended the loop, take the writer (and `closed` waiters) down
    // with it so the socket is fully released.
    stop.send_replace(true);
    tracing::debug!(connection_id = %id, "Receive loop ended");
}

/// Writer task: drains the outbound channel into the socket.
async fn run_writer(
    id: ConnectionId,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut local_shutdown: watch::Receiver<bool>,
) {
    loop {
        if *local_shutdown.borrow() {
            break;
        }

        tokio::select! {
            res = local_shutdown.changed() => if res.is_err() { break; },
            maybe = outbound_rx.recv() => match maybe {
                Some(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        tracing::debug!(connection_id = %id, error = %e, "Write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer_addr) = listener.accept().await.unwrap();
        (server_side, peer_addr, client)
    }

    fn test_handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> (ConnectionHandle, mpsc::Receiver<RelayEvent>, watch::Sender<bool>) {
        let (root_tx, root_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let handle = ConnectionHandle::new(
            7,
            stream,
            peer_addr,
            &RelayConfig::default(),
            root_rx,
            inbound_tx,
        );
        (handle, inbound_rx, root_tx)
    }

    #[tokio::test]
    async fn test_start_is_exactly_once() {
        let (stream, peer_addr, _client) = socket_pair().await;
        let (handle, _inbound, _root) = test_handle(stream, peer_addr);

        assert!(!handle.is_started());
        handle.start();
        assert!(handle.is_started());
        // Second call is a no-op, not a panic or respawn.
        handle.start();

        handle.dispose(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (stream, peer_addr, _client) = socket_pair().await;
        let (handle, _inbound, _root) = test_handle(stream, peer_addr);
        handle.start();

        let forced = handle.dispose(Duration::from_secs(1)).await;
        assert!(!forced);
        assert!(handle.is_disposed());

        // Second dispose returns immediately.
        assert!(!handle.dispose(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_dispose_returns_within_bound_with_stuck_tasks() {
        let (stream, peer_addr, mut client) = socket_pair().await;
        let (_root_tx, root_rx) = watch::channel(false);
        // Capacity-1 inbound channel that nothing drains: the reader gets
        // stuck forwarding its second chunk.
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let config = RelayConfig {
            outbound_buffer: 256,
            ..RelayConfig::default()
        };
        let handle = ConnectionHandle::new(7, stream, peer_addr, &config, root_rx, inbound_tx);
        handle.start();

        // Two chunks: the first fills the inbound channel, the second
        // blocks the receive loop mid-forward.
        client.write_all(&[b'a'; 256]).await.unwrap();
        client.write_all(&[b'b'; 256]).await.unwrap();

        // Queue far more than the socket buffers hold while the client
        // never reads, so the writer gets stuck in the middle of a write.
        let chunk = "x".repeat(128 * 1024);
        for _ in 0..128 {
            let _ = handle.send(&chunk);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let join_timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let forced = handle.dispose(join_timeout).await;
        let elapsed = started.elapsed();

        assert!(forced, "stuck tasks must be aborted");
        assert!(
            elapsed < join_timeout * 2,
            "dispose took {elapsed:?}, beyond the {join_timeout:?} bound"
        );
    }

    #[tokio::test]
    async fn test_dispose_without_start_closes_socket() {
        let (stream, peer_addr, mut client) = socket_pair().await;
        let (handle, _inbound, _root) = test_handle(stream, peer_addr);

        handle.dispose(Duration::from_secs(1)).await;

        // The server-side halves were dropped, so the client sees EOF.
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_receive_loop_emits_discrete_chunks() {
        let (stream, peer_addr, mut client) = socket_pair().await;
        let (handle, mut inbound, _root) = test_handle(stream, peer_addr);
        handle.start();

        client.write_all(b"hello").await.unwrap();
        let event = inbound.recv().await.unwrap();
        assert_eq!(event.sender_id, 7);
        assert_eq!(event.text, "hello");

        handle.dispose(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_peer_hangup_resolves_closed() {
        let (stream, peer_addr, client) = socket_pair().await;
        let (handle, _inbound, _root) = test_handle(stream, peer_addr);
        handle.start();

        drop(client);
        timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("closed() should resolve after peer hangup");

        handle.dispose(Duration::from_secs(1)).await;
    }
}

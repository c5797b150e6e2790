//! Socket transport: one TCP connection per broker, with request/reply
//! correlation and reconnect.
//!
//! A single I/O task owns the connection. It retries the TCP connect
//! forever (the serial-over-socket links drop routinely), then reads one
//! line at a time: objects with an `id` fulfil the matching pending call,
//! objects without one are forwarded FIFO to the notification channel.
//! Callers block only on their own oneshot slot; the reader never blocks
//! on a caller.
//!
//! Failures never cross this boundary as panics: every path out of
//! [`Transport::call`] is a `Result` whose error carries the wire
//! `{code, message}` shape (code 0 for client-side transport failures).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use avp_rpc::{LineDelimitedCodec, Message, Notification, Reply, Request, RpcError};

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Log the first failed connect and then only every Nth, so a broker that
/// is down overnight does not flood the log.
const CONNECT_LOG_INTERVAL: u64 = 60;

/// Granularity of [`Transport::wait_connected`] polling.
const CONNECT_POLL: Duration = Duration::from_millis(100);

type Sink = futures_util::stream::SplitSink<Framed<TcpStream, LineDelimitedCodec>, Request>;

type PendingCall = oneshot::Sender<Result<Reply, RpcError>>;

struct Shared {
    broker: String,
    addr: String,
    connected: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCall>>,
    sink: Mutex<Option<Sink>>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl Shared {
    /// Tear down the current connection: drop the sink and fail every
    /// in-flight call with a transport error.
    async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().await.take();
        let mut pending = self.pending.lock().await;
        for (id, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::transport(format!(
                "connection to {} lost awaiting reply {id}: {reason}",
                self.addr
            ))));
        }
    }
}

/// Request/reply transport for one broker connection.
pub struct Transport {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Transport {
    /// Start the I/O task for `host:port`. Returns the transport and the
    /// FIFO stream of notifications read from the socket.
    ///
    /// The connection is established in the background; observe progress
    /// through [`is_connected`](Self::is_connected) or
    /// [`wait_connected`](Self::wait_connected).
    #[must_use]
    pub fn connect(
        broker: &str,
        host: &str,
        port: u16,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            broker: broker.to_string(),
            addr: format!("{host}:{port}"),
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            notifications: notify_tx,
        });

        tokio::spawn(io_loop(Arc::clone(&shared), shutdown_rx));

        (
            Self {
                shared,
                next_id: AtomicU64::new(1),
                shutdown_tx,
            },
            notify_rx,
        )
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Poll until connected or `timeout` elapses. Returns the final
    /// connection state.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(CONNECT_POLL).await;
        }
        true
    }

    /// Send a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns the server's error object for failed replies, or a
    /// transport error (code 0) when not connected, when the send fails,
    /// or when no reply arrives within `timeout`. On timeout the pending
    /// entry is evicted; a reply that straggles in later is dropped by the
    /// reader with a debug log.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::transport(format!(
                "not connected to {} broker at {}",
                self.shared.broker, self.shared.addr
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let request = Request::new(method, id, params);
        {
            let mut sink = self.shared.sink.lock().await;
            let sent = match sink.as_mut() {
                Some(sink) => sink.send(request).await.map_err(|e| e.to_string()),
                None => Err("connection closed".to_string()),
            };
            if let Err(e) = sent {
                drop(sink);
                self.shared.pending.lock().await.remove(&id);
                return Err(RpcError::transport(format!(
                    "send of '{method}' (id {id}) to {} failed: {e}",
                    self.shared.broker
                )));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => reply.into_result(),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RpcError::transport(format!(
                "{} transport shut down awaiting '{method}' (id {id})",
                self.shared.broker
            ))),
            Err(_) => {
                // Abandon and evict: without this, entries for replies
                // that never arrive would accumulate forever.
                self.shared.pending.lock().await.remove(&id);
                Err(RpcError::transport(format!(
                    "'{method}' (id {id}) to {} timed out after {timeout:?}",
                    self.shared.broker
                )))
            }
        }
    }

    /// Stop the I/O task and close the socket. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn io_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempts: u64 = 0;

    'connect: while !*shutdown.borrow() {
        attempts += 1;
        let stream = tokio::select! {
            result = TcpStream::connect(&shared.addr) => result,
            _ = shutdown.changed() => break 'connect,
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                if attempts == 1 || attempts % CONNECT_LOG_INTERVAL == 0 {
                    info!(
                        broker = %shared.broker,
                        addr = %shared.addr,
                        attempts,
                        "connection failed: {e}"
                    );
                }
                tokio::select! {
                    () = tokio::time::sleep(RECONNECT_DELAY) => continue 'connect,
                    _ = shutdown.changed() => break 'connect,
                }
            }
        };

        if attempts > 1 {
            debug!(broker = %shared.broker, addr = %shared.addr, "re-connected");
        } else {
            debug!(broker = %shared.broker, addr = %shared.addr, "connected");
        }
        attempts = 0;

        let (sink, mut stream) = Framed::new(stream, LineDelimitedCodec::new()).split();
        *shared.sink.lock().await = Some(sink);
        shared.connected.store(true, Ordering::SeqCst);

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.changed() => break 'connect,
            };
            match item {
                Some(Ok(Message::Reply(reply))) => {
                    let mut pending = shared.pending.lock().await;
                    if let Some(tx) = pending.remove(&reply.id) {
                        let _ = tx.send(Ok(reply));
                    } else {
                        debug!(
                            broker = %shared.broker,
                            id = reply.id,
                            "dropping reply for abandoned request"
                        );
                    }
                }
                Some(Ok(Message::Notification(notification))) => {
                    if shared.notifications.send(notification).is_err() {
                        debug!(broker = %shared.broker, "notification consumer gone");
                    }
                }
                Some(Err(e)) => {
                    warn!(broker = %shared.broker, "read failed: {e}");
                    shared.drop_connection(&e.to_string()).await;
                    continue 'connect;
                }
                None => {
                    info!(broker = %shared.broker, "connection closed by broker");
                    shared.drop_connection("closed by peer").await;
                    continue 'connect;
                }
            }
        }
    }

    shared.drop_connection("transport shut down").await;
}

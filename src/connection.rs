//! # Stage: Node Connection
//!
//! ## Responsibility
//! Own one persistent channel to one remote worker: open the transport,
//! perform the two-frame handshake, expose a FIFO outbound queue consumed
//! by a dedicated writer task, and run an independent receive loop that
//! decodes inbound frames and delivers them to the collector stage.
//!
//! ## Guarantees
//! - Ordered: frames leave in enqueue order (single writer task, FIFO queue)
//! - Bounded shutdown: queue drain during close is capped by a deadline
//!   instead of blocking on a stalled peer forever
//! - Isolated failure: a transport or decode error on the receive loop
//!   marks this connection `Failed` and stops delivery, but is never
//!   surfaced synchronously to in-flight enqueue calls
//!
//! ## NOT Responsible For
//! - Choosing when a connection exists (see: `router`)
//! - Payload semantics (see: `codec`)

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::codec::SlotCodecs;
use crate::stage::Stage;
use crate::wire::{self, SLOT_CLOSE, SLOT_CONFIG, SLOT_PARAMETERS};
use crate::{Envelope, RouterError};

/// Connection lifecycle.
///
/// `Failed` is terminal and reachable from `Handshaking` or `Ready` on any
/// transport or decode error; a failed connection is never retried.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, transport not yet opened.
    Unopened,
    /// Transport open, handshake frames not yet sent.
    Handshaking,
    /// Handshake complete; accepting sends, receive loop running.
    Ready,
    /// Close requested; draining the outbound queue.
    Closing,
    /// Fully torn down.
    Closed,
    /// Transport or decode error; terminal.
    Failed,
}

/// Deadlines for the connection's blocking phases.
///
/// The original design had none of these and could block indefinitely on a
/// stalled peer; every phase here is bounded.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// Deadline for the TCP connect.
    pub connect: Duration,
    /// Deadline covering both handshake frames.
    pub handshake: Duration,
    /// Deadline for draining the outbound queue during close.
    pub drain: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            handshake: Duration::from_secs(5),
            drain: Duration::from_secs(30),
        }
    }
}

/// Items travelling through the outbound queue.
enum Outbound {
    Frame(Envelope),
    Close,
}

/// One persistent, bidirectional channel to a remote worker node.
///
/// Created lazily by the distributor on first need for a destination index
/// and reused for every subsequent unit carrying that index until shutdown.
pub struct NodeConnection {
    id: Uuid,
    peer: String,
    timeouts: ConnectionTimeouts,
    codecs: SlotCodecs,
    collector: Arc<dyn Stage>,
    state: Arc<StdRwLock<ConnectionState>>,
    stream: Option<TcpStream>,
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
    receiver_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn store_state(cell: &Arc<StdRwLock<ConnectionState>>, next: ConnectionState) {
    match cell.write() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn load_state(cell: &Arc<StdRwLock<ConnectionState>>) -> ConnectionState {
    match cell.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

impl NodeConnection {
    /// Create an unopened connection to `address:port`.
    ///
    /// `codecs` carries the slot bindings from the sub-pipeline this
    /// connection will ship; `collector` receives every decoded result the
    /// remote side returns.
    pub fn new(
        address: &str,
        port: u16,
        codecs: SlotCodecs,
        collector: Arc<dyn Stage>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: format!("{address}:{port}"),
            timeouts,
            codecs,
            collector,
            state: Arc::new(StdRwLock::new(ConnectionState::Unopened)),
            stream: None,
            outbound_tx: None,
            writer_task: StdMutex::new(None),
            receiver_task: StdMutex::new(None),
        }
    }

    /// Unique id for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer endpoint in `address:port` form.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        load_state(&self.state)
    }

    /// Establish the transport. No retry: a failure is final for this
    /// connection object.
    ///
    /// # Errors
    ///
    /// [`RouterError::Connect`] on refusal or deadline expiry.
    pub async fn open(&mut self) -> Result<(), RouterError> {
        let connect = TcpStream::connect(&self.peer);
        let stream = match tokio::time::timeout(self.timeouts.connect, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                store_state(&self.state, ConnectionState::Failed);
                return Err(RouterError::Connect {
                    addr: self.peer.clone(),
                    source,
                });
            }
            Err(_) => {
                store_state(&self.state, ConnectionState::Failed);
                return Err(RouterError::Connect {
                    addr: self.peer.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect deadline expired",
                    ),
                });
            }
        };

        self.stream = Some(stream);
        store_state(&self.state, ConnectionState::Handshaking);
        debug!(id = %self.id, peer = %self.peer, "transport open");
        Ok(())
    }

    /// Send the two handshake frames — sub-pipeline configuration, then the
    /// parameter document — and start the writer task and receive loop.
    ///
    /// # Errors
    ///
    /// [`RouterError::Handshake`] if either frame cannot be sent before the
    /// deadline, or if called out of order.
    pub async fn handshake(
        &mut self,
        config_toml: &str,
        parameters: &str,
    ) -> Result<(), RouterError> {
        let mut stream = match self.stream.take() {
            Some(stream) if self.state() == ConnectionState::Handshaking => stream,
            _ => {
                return Err(RouterError::Handshake {
                    addr: self.peer.clone(),
                    reason: "connection not in handshaking state".to_string(),
                })
            }
        };

        let frames = async {
            wire::write_frame(&mut stream, SLOT_CONFIG, config_toml.as_bytes()).await?;
            wire::write_frame(&mut stream, SLOT_PARAMETERS, parameters.as_bytes()).await?;
            Ok::<(), RouterError>(())
        };
        match tokio::time::timeout(self.timeouts.handshake, frames).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                store_state(&self.state, ConnectionState::Failed);
                return Err(RouterError::Handshake {
                    addr: self.peer.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                store_state(&self.state, ConnectionState::Failed);
                return Err(RouterError::Handshake {
                    addr: self.peer.clone(),
                    reason: "handshake deadline expired".to_string(),
                });
            }
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(writer_loop(
            rx,
            write_half,
            self.codecs.clone(),
            Arc::clone(&self.state),
            self.id,
            self.peer.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            read_half,
            self.codecs.clone(),
            Arc::clone(&self.collector),
            Arc::clone(&self.state),
            self.id,
            self.peer.clone(),
        ));

        self.outbound_tx = Some(tx);
        if let Ok(mut guard) = self.writer_task.lock() {
            *guard = Some(writer);
        }
        if let Ok(mut guard) = self.receiver_task.lock() {
            *guard = Some(receiver);
        }

        store_state(&self.state, ConnectionState::Ready);
        info!(id = %self.id, peer = %self.peer, "connection ready");
        Ok(())
    }

    /// Append one unit to the outbound queue.
    ///
    /// Thread-safe and FIFO; may be called concurrently by multiple
    /// distributor invocations. The queue is unbounded (bounded only by
    /// memory).
    ///
    /// # Errors
    ///
    /// [`RouterError::Enqueue`] if the connection is not `Ready` or its
    /// writer task is gone.
    pub fn enqueue(&self, unit: Envelope) -> Result<(), RouterError> {
        if self.state() != ConnectionState::Ready {
            return Err(RouterError::Enqueue {
                target: self.peer.clone(),
            });
        }
        match &self.outbound_tx {
            Some(tx) => tx
                .send(Outbound::Frame(unit))
                .map_err(|_| RouterError::Enqueue {
                    target: self.peer.clone(),
                }),
            None => Err(RouterError::Enqueue {
                target: self.peer.clone(),
            }),
        }
    }

    /// Close the connection: stop accepting sends, enqueue the close
    /// sentinel, wait (bounded) for the outbound queue to drain, terminate
    /// and join the receive loop, release the transport.
    ///
    /// Idempotent: closing a `Closed` or `Failed` connection is a no-op.
    ///
    /// # Errors
    ///
    /// [`RouterError::Timeout`] if the drain deadline expires; teardown
    /// still completes.
    pub async fn close(&self) -> Result<(), RouterError> {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Failed => return Ok(()),
            ConnectionState::Unopened => {
                store_state(&self.state, ConnectionState::Closed);
                return Ok(());
            }
            _ => store_state(&self.state, ConnectionState::Closing),
        }

        if let Some(tx) = &self.outbound_tx {
            // Exactly one sentinel per close; writer exits after emitting it.
            let _ = tx.send(Outbound::Close);
        }

        let writer = self.writer_task.lock().ok().and_then(|mut g| g.take());
        let mut drain_timed_out = false;
        if let Some(handle) = writer {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.timeouts.drain, handle).await.is_err() {
                drain_timed_out = true;
                abort.abort();
            }
        }

        let receiver = self.receiver_task.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = receiver {
            handle.abort();
            let _ = handle.await;
        }

        if self.state() != ConnectionState::Failed {
            store_state(&self.state, ConnectionState::Closed);
        }
        info!(id = %self.id, peer = %self.peer, drain_timed_out, "connection closed");

        if drain_timed_out {
            return Err(RouterError::Timeout(format!(
                "outbound queue for {} did not drain within {:?}",
                self.peer, self.timeouts.drain
            )));
        }
        Ok(())
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        for slot in [&self.writer_task, &self.receiver_task] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Sole consumer of the outbound queue: encodes and writes frames in
/// enqueue order, emits the close frame on the sentinel, exits on either
/// the sentinel or a write failure.
async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut write_half: OwnedWriteHalf,
    codecs: SlotCodecs,
    state: Arc<StdRwLock<ConnectionState>>,
    id: Uuid,
    peer: String,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(unit) => {
                let slot = unit.slot;
                let encoded = match codecs.writer(slot) {
                    Some(codec) => codec.encode(&unit),
                    None => Ok(unit.payload),
                };
                let body = match encoded {
                    Ok(body) => body,
                    Err(e) => {
                        store_state(&state, ConnectionState::Failed);
                        error!(id = %id, peer = %peer, slot, error = %e, "outbound encode failed");
                        break;
                    }
                };
                if let Err(e) = wire::write_frame(&mut write_half, slot, &body).await {
                    store_state(&state, ConnectionState::Failed);
                    error!(id = %id, peer = %peer, slot, error = %e, "outbound write failed");
                    break;
                }
            }
            Outbound::Close => {
                // Best effort: the peer may already be gone.
                if let Err(e) = wire::write_frame(&mut write_half, SLOT_CLOSE, &[]).await {
                    debug!(id = %id, peer = %peer, error = %e, "close frame not delivered");
                }
                break;
            }
        }
    }
    debug!(id = %id, peer = %peer, "writer task exiting");
}

/// Independent inbound loop for the life of the connection: decodes frames
/// with the codec bound to each slot and delivers results to the collector.
/// Any failure here is fatal to this connection only.
async fn receive_loop(
    mut read_half: OwnedReadHalf,
    codecs: SlotCodecs,
    collector: Arc<dyn Stage>,
    state: Arc<StdRwLock<ConnectionState>>,
    id: Uuid,
    peer: String,
) {
    loop {
        let (slot, body) = match wire::read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(e) => {
                match load_state(&state) {
                    ConnectionState::Closing | ConnectionState::Closed => {
                        debug!(id = %id, peer = %peer, "transport ended during shutdown");
                    }
                    _ => {
                        store_state(&state, ConnectionState::Failed);
                        error!(id = %id, peer = %peer, error = %e, "receive loop transport failure");
                    }
                }
                break;
            }
        };

        if slot == SLOT_CLOSE {
            info!(id = %id, peer = %peer, "peer signalled close");
            break;
        }

        let unit = match codecs.reader(slot) {
            Some(codec) => codec.decode(slot, body),
            None => Ok(Envelope { slot, payload: body }),
        };
        let unit = match unit {
            Ok(unit) => unit,
            Err(e) => {
                store_state(&state, ConnectionState::Failed);
                error!(id = %id, peer = %peer, slot, error = %e, "inbound decode failed");
                break;
            }
        };

        if let Err(e) = collector.process(unit).await {
            store_state(&state, ConnectionState::Failed);
            error!(id = %id, peer = %peer, slot, error = %e, "collector refused result");
            break;
        }
    }
    debug!(id = %id, peer = %peer, "receive loop exiting");
}

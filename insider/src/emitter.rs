//! At-least-once delivery of frames that must not be lost.
//!
//! Presence and terminal output are fire-and-forget; document patches are
//! not. The emitter tags each reliable frame with a sequence number and
//! re-sends it until the peer acks that number or the attempt budget runs
//! out. Redelivery is safe because patch application is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ServerEvent, ServerFrame};

const ACK_TIMEOUT: Duration = Duration::from_millis(2000);
const MAX_ATTEMPTS: u32 = 5;

/// Delivery errors.
#[derive(Debug, Clone)]
pub enum DeliveryError {
    /// Every attempt timed out without an ack.
    Exhausted { seq: u64, attempts: u32 },
    /// The outbound channel is gone; the connection is dead.
    Disconnected,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { seq, attempts } => {
                write!(f, "frame {seq} unacknowledged after {attempts} attempts")
            }
            Self::Disconnected => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Per-connection reliable sender.
///
/// Shared between the session task (which emits) and the connection reader
/// (which feeds acks back in), hence the internal locking.
pub struct ReliableEmitter {
    tx: mpsc::UnboundedSender<ServerFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_seq: AtomicU64,
}

impl ReliableEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            tx,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Send `event` without an ack requirement.
    pub fn emit(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.tx
            .send(ServerFrame::new(event))
            .map_err(|_| DeliveryError::Disconnected)
    }

    /// Send `event` and wait for the peer's ack, re-sending on timeout.
    pub async fn emit_with_ack(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = ServerFrame::with_seq(seq, event);

        for attempt in 1..=MAX_ATTEMPTS {
            let (ack_tx, ack_rx) = oneshot::channel();
            {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.insert(seq, ack_tx);
            }

            if self.tx.send(frame.clone()).is_err() {
                self.forget(seq);
                return Err(DeliveryError::Disconnected);
            }

            match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => return Ok(()),
                // Sender dropped: emitter torn down mid-flight.
                Ok(Err(_)) => return Err(DeliveryError::Disconnected),
                Err(_) => {
                    self.forget(seq);
                    debug!("frame {seq} attempt {attempt}/{MAX_ATTEMPTS} timed out");
                }
            }
        }

        warn!("giving up on frame {seq} after {MAX_ATTEMPTS} attempts");
        Err(DeliveryError::Exhausted {
            seq,
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Feed a peer ack back in. Unknown sequence numbers (late acks for
    /// frames already re-sent or abandoned) are ignored.
    pub fn acknowledge(&self, seq: u64) {
        let sender = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&seq)
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn forget(&self, seq: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&seq);
    }
}

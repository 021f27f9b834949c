//! The outbound send pipeline.
//!
//! A bounded FIFO queue feeds a single sender task that writes `send`
//! commands to the sidecar, pacing consecutive writes. Enqueueing blocks
//! briefly and then fails loudly; nothing is ever dropped silently. The
//! sender does not wait for `ev:"sent"` acknowledgments; those are
//! informational.

use std::sync::Arc;
use std::time::Duration;

use anyhow::format_err;
use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::Result;

/// How long `enqueue` waits for queue capacity before reporting
/// backpressure to the caller.
const ENQUEUE_WAIT: Duration = Duration::from_secs(1);

/// One DM waiting to be handed to the sidecar.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub dest: String,
    pub payload_b64: String,
    /// Opaque 128-bit hex handle, unique per outbound DM.
    pub id: String,
}

/// Where the sender task writes drained messages. The sidecar supervisor
/// is the production implementation; tests substitute their own.
#[async_trait]
pub trait CommandSink: Send + Sync + 'static {
    async fn send_now(&self, msg: &OutboundMessage) -> Result<()>;
}

/// Cloneable handle for enqueueing outbound DMs.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<OutboundMessage>,
}

impl SendQueue {
    /// Create a queue with the given capacity, returning the enqueue
    /// handle and the receiver for [`spawn_sender`].
    pub fn new(capacity: usize) -> (SendQueue, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SendQueue { tx }, rx)
    }

    /// Enqueue one DM, waiting up to a second for capacity.
    pub async fn enqueue(&self, dest: &str, payload_b64: String, id: &str) -> Result<()> {
        let msg = OutboundMessage {
            dest: dest.to_owned(),
            payload_b64,
            id: id.to_owned(),
        };
        match timeout(ENQUEUE_WAIT, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(format_err!("send queue is closed")),
            Err(_) => {
                counter!("forwarder.send_queue.backpressure.total", 1);
                Err(format_err!("send queue is full; backpressure active"))
            }
        }
    }
}

/// Start the sender task: drain the queue FIFO, write each command to the
/// sink, and pace successive writes by `delay`.
pub fn spawn_sender(
    sink: Arc<dyn CommandSink>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            debug!(id = %msg.id, dest = %msg.dest, "sending DM");
            if let Err(err) = sink.send_now(&msg).await {
                warn!(id = %msg.id, "send queue error: {}", err);
            }
            counter!("forwarder.dms_sent.total", 1);
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    })
}

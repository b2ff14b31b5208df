//! Receiver registration, fan-in, and the write-back / intent-writer seams.

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ipc::events::{IntentMessage, ReceiverControl, ReceiverEvent};

/// Reverse channel from the dispatcher to one receiver.
///
/// Called inline from the dispatch loop, so implementations must return
/// promptly; failures are logged by the caller and never abort dispatch.
pub trait ControlWriter: Send + Sync {
    fn write(&self, control: ReceiverControl) -> anyhow::Result<()>;
}

/// Sink for every outbound message. Same contract as `ControlWriter`.
pub trait IntentWriter: Send + Sync {
    fn write(&self, message: &IntentMessage) -> anyhow::Result<()>;
}

impl ControlWriter for mpsc::UnboundedSender<ReceiverControl> {
    fn write(&self, control: ReceiverControl) -> anyhow::Result<()> {
        self.send(control)
            .map_err(|_| anyhow!("receiver control channel closed"))
    }
}

/// Bounded channel writer: a full channel is reported as a failure instead
/// of stalling the dispatcher.
impl IntentWriter for mpsc::Sender<IntentMessage> {
    fn write(&self, message: &IntentMessage) -> anyhow::Result<()> {
        self.try_send(message.clone())
            .map_err(|e| anyhow!("intent channel: {e}"))
    }
}

/// One external source of hotword / audio / debug events.
pub struct Receiver {
    events: mpsc::Receiver<ReceiverEvent>,
    control: Box<dyn ControlWriter>,
}

impl Receiver {
    pub fn new(events: mpsc::Receiver<ReceiverEvent>, control: impl ControlWriter + 'static) -> Self {
        Self {
            events,
            control: Box::new(control),
        }
    }

    /// In-process receiver backed by channels. The endpoint is the source's
    /// side: push events in, read write-backs out.
    pub fn channel(capacity: usize) -> (Self, ReceiverEndpoint) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self::new(events_rx, control_tx),
            ReceiverEndpoint {
                events: events_tx,
                control: control_rx,
            },
        )
    }

    pub(crate) fn into_parts(self) -> (mpsc::Receiver<ReceiverEvent>, Box<dyn ControlWriter>) {
        (self.events, self.control)
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

/// Source-side ends of a channel-backed `Receiver`.
#[derive(Debug)]
pub struct ReceiverEndpoint {
    pub events: mpsc::Sender<ReceiverEvent>,
    pub control: mpsc::UnboundedReceiver<ReceiverControl>,
}

/// An event tagged with where it came from.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub source: usize,
    pub is_test: bool,
    pub event: ReceiverEvent,
}

/// Relay one receiver's events into the dispatcher queue until shutdown or
/// until the receiver's stream ends.
pub(crate) async fn forward(
    source: usize,
    is_test: bool,
    mut events: mpsc::Receiver<ReceiverEvent>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            debug!(source, "receiver stream ended");
            break;
        };

        let tagged = Inbound {
            source,
            is_test,
            event,
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = inbound.send(tagged) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(source, "forwarding task exiting");
}

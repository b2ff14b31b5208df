//! Buffer stage between the dispatcher and a session's send task.
//!
//! ```text
//! dispatcher ──Vec<u8>──▶ AudioIntake (unbounded) ──▶ BufferStage ──chunk──▶ ChunkReceiver (cap 1)
//! ```
//!
//! The stage owns the pending bytes for the whole session; nothing else reads
//! or writes them. Each loop iteration either accepts more bytes or, when a
//! full chunk is buffered, offers exactly one chunk to the send task.

pub mod chunk;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use chunk::{ChunkSpec, PendingAudio};

/// Producer half held by the dispatcher. Sends never block.
pub type AudioIntake = mpsc::UnboundedSender<Vec<u8>>;

/// Consumer half held by the send task.
pub type ChunkReceiver = mpsc::Receiver<Vec<u8>>;

/// One chunk in flight between the buffer and send tasks.
const CHUNK_OFFER_CAP: usize = 1;

/// Buffer task state. Create with [`buffer_stage`] and drive with [`BufferStage::run`].
pub struct BufferStage {
    pending: PendingAudio,
    intake: mpsc::UnboundedReceiver<Vec<u8>>,
    chunks: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Build a matched intake / stage / chunk-output triple.
pub fn buffer_stage(
    chunk_bytes: usize,
    cancel: CancellationToken,
) -> (AudioIntake, BufferStage, ChunkReceiver) {
    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_OFFER_CAP);
    let stage = BufferStage {
        pending: PendingAudio::new(chunk_bytes),
        intake: intake_rx,
        chunks: chunk_tx,
        cancel,
    };
    (intake_tx, stage, chunk_rx)
}

impl BufferStage {
    /// Run until cancelled, until the send task goes away, or until the
    /// intake is closed with less than one chunk left.
    ///
    /// Returns the number of chunks handed to the send task.
    pub async fn run(mut self) -> usize {
        let mut offered = 0usize;
        let mut intake_open = true;

        loop {
            let ready = self.pending.has_chunk();
            if !intake_open && !ready {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.chunks.reserve(), if ready => match permit {
                    Ok(permit) => {
                        if let Some(chunk) = self.pending.take_chunk() {
                            permit.send(chunk);
                            offered += 1;
                        }
                    }
                    Err(_) => break,
                },
                bytes = self.intake.recv(), if intake_open => match bytes {
                    Some(bytes) => self.pending.push(&bytes),
                    None => intake_open = false,
                },
            }
        }

        debug!(
            offered,
            remaining = self.pending.len(),
            "buffer stage exiting"
        );
        offered
    }
}

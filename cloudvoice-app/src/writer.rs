use std::io::Write;

use anyhow::Context;
use cloudvoice_core::{IntentMessage, IntentWriter};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Writes each message as one JSON line.
pub struct JsonLinesWriter<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl JsonLinesWriter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> IntentWriter for JsonLinesWriter<W> {
    fn write(&self, message: &IntentMessage) -> anyhow::Result<()> {
        let line = serde_json::to_string(message).context("serializing intent message")?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

/// Fires `stop` once a terminal outcome has been written.
pub struct StopOnOutcome {
    stop: CancellationToken,
}

impl StopOnOutcome {
    pub fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }
}

impl IntentWriter for StopOnOutcome {
    fn write(&self, message: &IntentMessage) -> anyhow::Result<()> {
        if matches!(message, IntentMessage::Intent(_) | IntentMessage::Error(_)) {
            self.stop.cancel();
        }
        Ok(())
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct DispatchDiagnostics {
    pub sessions_started: AtomicUsize,
    pub sessions_superseded: AtomicUsize,
    pub intents_delivered: AtomicUsize,
    pub errors_delivered: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub audio_forwarded: AtomicUsize,
    pub audio_discarded: AtomicUsize,
    pub writer_failures: AtomicUsize,
    pub write_back_failures: AtomicUsize,
}

impl DispatchDiagnostics {
    pub fn reset(&self) {
        self.sessions_started.store(0, Ordering::Relaxed);
        self.sessions_superseded.store(0, Ordering::Relaxed);
        self.intents_delivered.store(0, Ordering::Relaxed);
        self.errors_delivered.store(0, Ordering::Relaxed);
        self.streams_opened.store(0, Ordering::Relaxed);
        self.audio_forwarded.store(0, Ordering::Relaxed);
        self.audio_discarded.store(0, Ordering::Relaxed);
        self.writer_failures.store(0, Ordering::Relaxed);
        self.write_back_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_superseded: self.sessions_superseded.load(Ordering::Relaxed),
            intents_delivered: self.intents_delivered.load(Ordering::Relaxed),
            errors_delivered: self.errors_delivered.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            audio_forwarded: self.audio_forwarded.load(Ordering::Relaxed),
            audio_discarded: self.audio_discarded.load(Ordering::Relaxed),
            writer_failures: self.writer_failures.load(Ordering::Relaxed),
            write_back_failures: self.write_back_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub sessions_started: usize,
    pub sessions_superseded: usize,
    pub intents_delivered: usize,
    pub errors_delivered: usize,
    pub streams_opened: usize,
    pub audio_forwarded: usize,
    pub audio_discarded: usize,
    pub writer_failures: usize,
    pub write_back_failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_counter() {
        let diag = DispatchDiagnostics::default();
        DispatchDiagnostics::bump(&diag.sessions_started);
        DispatchDiagnostics::bump(&diag.audio_discarded);
        DispatchDiagnostics::bump(&diag.audio_discarded);
        assert_eq!(diag.snapshot().audio_discarded, 2);

        diag.reset();
        assert_eq!(diag.snapshot(), DiagnosticsSnapshot::default());
    }
}

//! Messages crossing component boundaries.
//!
//! ## Directions
//!
//! | Type | From | To |
//! |------|------|----|
//! | `ReceiverEvent` | receiver (mic process, test source) | dispatcher |
//! | `ReceiverControl` | dispatcher | every registered receiver |
//! | `IntentMessage` | dispatcher | every registered intent writer |
//!
//! All types serialize with camelCase fields so a host can emit them as JSON
//! lines without a translation layer.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Receiver → dispatcher
// ---------------------------------------------------------------------------

/// One control/audio event produced by a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ReceiverEvent {
    /// Wake signal: start a new session.
    Hotword(HotwordEvent),
    /// Raw PCM16 mono samples for the active session.
    Audio(AudioSamples),
    /// Opaque diagnostic payload forwarded verbatim to intent writers.
    Debug(String),
    /// The receiver has no more audio for the active session.
    EndOfAudio,
}

/// Parameters a receiver attaches to a hotword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotwordEvent {
    pub stream_type: StreamType,
    /// Locale such as `en-US` or `fr_FR`.
    pub locale: String,
}

impl HotwordEvent {
    pub fn new(stream_type: StreamType, locale: impl Into<String>) -> Self {
        Self {
            stream_type,
            locale: locale.into(),
        }
    }
}

/// Kind of request the receiver wants streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Normal,
    Blackjack,
    KnowledgeGraph,
    ConnectionCheck,
    /// Any value this build does not understand.
    #[serde(other)]
    Unknown,
}

/// PCM16 samples as captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSamples {
    pub samples: Vec<i16>,
}

impl AudioSamples {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Little-endian byte view, the layout the cloud service expects.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Dispatcher → receiver
// ---------------------------------------------------------------------------

/// Write-back the dispatcher sends to receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverControl {
    /// A terminal outcome arrived; stop capturing audio.
    StopListening,
    /// A synthetic hotword from a test source is starting a session.
    TestStarted,
}

// ---------------------------------------------------------------------------
// Dispatcher → intent writers
// ---------------------------------------------------------------------------

/// Everything an intent writer can observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum IntentMessage {
    Intent(IntentResult),
    Error(ErrorResponse),
    StreamOpen(StreamOpenEvent),
    Debug(String),
}

/// Normalized terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResult {
    pub session_id: String,
    pub action: String,
    /// JSON object of string parameters; absent when the service sent none.
    pub parameters: Option<String>,
    /// Human-readable query text / confidence / handler summary.
    pub metadata: String,
}

/// Classified failure of a session (or of a hotword that never became one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

/// Emitted once per session after the stream to the service is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenEvent {
    pub session_id: String,
}

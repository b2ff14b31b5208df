//! # cloudvoice-core
//!
//! Audio-streaming session orchestrator for a cloud voice assistant.
//!
//! ## Architecture
//!
//! ```text
//! Receiver ─┐
//! Receiver ─┼─ forwarding tasks ─► Dispatcher loop ──► IntentWriters
//! Receiver ─┘                        │      ▲    └───► Receiver write-back
//!                                    │      │
//!                          audio     ▼      │ Opened / Outcome
//!                               BufferStage │
//!                                    │      │
//!                                    ▼      │
//!                              StreamingSession ◄──► Transport (cloud)
//! ```
//!
//! One session is active at a time. Each session delivers at most one
//! outcome, and nothing after it has been closed.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod resolve;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use engine::{
    ControlWriter, DiagnosticsSnapshot, Dispatcher, EngineConfig, IntentWriter, Receiver,
    ReceiverEndpoint,
};
pub use error::{CloudVoiceError, ErrorKind};
pub use ipc::events::{
    AudioSamples, ErrorResponse, HotwordEvent, IntentMessage, IntentResult, ReceiverControl,
    ReceiverEvent, StreamOpenEvent, StreamType,
};
pub use resolve::{LanguageCode, RobotMode, StreamKind};
pub use transport::{
    AudioEncoder, EncoderFactory, StubConfig, StubFailure, StubTransport, TokenSource, Transport,
};

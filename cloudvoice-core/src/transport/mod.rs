//! Cloud service collaborator abstraction.
//!
//! The session never touches the wire format. It talks to a `Transport`
//! that hands out a `Connection`, which opens one typed `CloudStream`:
//!
//! ```text
//! Transport::connect(ConnectRequest) ─► Connection::open_stream(kind) ─► CloudStream
//!                                                                        ├─ send_audio (many)
//!                                                                        ├─ wait_for_response (once)
//!                                                                        └─ close
//! ```
//!
//! Implementations report failures as `anyhow::Error`; the session classifies
//! them by the phase they occur in.

pub mod response;
pub mod stub;

use std::sync::Arc;

use async_trait::async_trait;

use crate::resolve::{LanguageCode, StreamKind};

pub use response::{
    ConnectionCheckResponse, IntentResponse, KnowledgeGraphResponse, StreamResponse,
};
pub use stub::{StubConfig, StubFailure, StubTransport};

/// What the session knows when it dials the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub session_id: String,
    /// Bearer token, when a token source produced one.
    pub token: Option<String>,
    pub handler: Option<String>,
}

/// Stream parameters, sent with the first audio message only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub session_id: String,
    pub kind: StreamKind,
    pub language: LanguageCode,
    pub sample_rate: u32,
    pub compressed: bool,
    pub handler: Option<String>,
}

/// One outbound audio message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAudio {
    /// `Some` on the first message of a stream.
    pub metadata: Option<StreamMetadata>,
    pub audio: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> anyhow::Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_stream(
        &self,
        kind: StreamKind,
        language: LanguageCode,
    ) -> anyhow::Result<Arc<dyn CloudStream>>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// A typed stream. `send_audio` and `wait_for_response` are called
/// concurrently from different tasks.
#[async_trait]
pub trait CloudStream: Send + Sync {
    async fn send_audio(&self, message: OutboundAudio) -> anyhow::Result<()>;

    /// Resolves once with the terminal response of the stream.
    async fn wait_for_response(&self) -> anyhow::Result<StreamResponse>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Blocking bearer-token provider. Called on the blocking thread pool.
pub trait TokenSource: Send + Sync {
    fn fetch_token(&self) -> anyhow::Result<String>;
}

/// Per-session lossy encoder for raw PCM bytes.
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Emit whatever the encoder still holds at end of audio.
    fn flush(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// Builds a fresh encoder for each session.
pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn AudioEncoder> + Send + Sync>;

//! `StubTransport`: in-process service that answers without a network.
//!
//! Used for development and demos. It counts audio messages and, once
//! `respond_after_messages` have arrived, resolves the pending
//! `wait_for_response` with the configured canned response. A configured
//! `StubFailure` makes the matching phase fail instead, so every error path
//! of a session can be exercised end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    CloudStream, ConnectRequest, Connection, IntentResponse, OutboundAudio, StreamResponse,
    Transport,
};
use crate::resolve::{LanguageCode, StreamKind};

/// Phase the stub should fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubFailure {
    Connect,
    OpenStream,
    Send,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StubConfig {
    pub respond_after_messages: usize,
    pub response: StreamResponse,
    pub failure: Option<StubFailure>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            respond_after_messages: 8,
            response: StreamResponse::Intent(IntentResponse {
                action: "intent_system_noaudio".into(),
                query_text: "[stub]".into(),
                confidence: 1.0,
                handler: "stub".into(),
                ..IntentResponse::default()
            }),
            failure: None,
        }
    }
}

/// Echo-style stub service.
#[derive(Debug, Clone, Default)]
pub struct StubTransport {
    config: StubConfig,
}

impl StubTransport {
    pub fn new(config: StubConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self, request: &ConnectRequest) -> anyhow::Result<Box<dyn Connection>> {
        if self.config.failure == Some(StubFailure::Connect) {
            bail!("stub: connection refused for {}", request.url);
        }
        debug!(session_id = %request.session_id, "stub connected");
        Ok(Box::new(StubConnection {
            config: self.config.clone(),
        }))
    }
}

struct StubConnection {
    config: StubConfig,
}

#[async_trait]
impl Connection for StubConnection {
    async fn open_stream(
        &self,
        kind: StreamKind,
        language: LanguageCode,
    ) -> anyhow::Result<Arc<dyn CloudStream>> {
        if self.config.failure == Some(StubFailure::OpenStream) {
            bail!("stub: stream rejected");
        }
        debug!(?kind, ?language, "stub stream opened");
        Ok(Arc::new(StubStream {
            config: self.config.clone(),
            received: AtomicUsize::new(0),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct StubStream {
    config: StubConfig,
    received: AtomicUsize,
    ready: Notify,
    closed: AtomicBool,
}

#[async_trait]
impl CloudStream for StubStream {
    async fn send_audio(&self, message: OutboundAudio) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("stub: stream closed");
        }
        if self.config.failure == Some(StubFailure::Send) {
            bail!("stub: send failed");
        }
        let n = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.config.respond_after_messages.max(1) {
            debug!(messages = n, bytes = message.audio.len(), "stub response ready");
            self.ready.notify_one();
        }
        Ok(())
    }

    async fn wait_for_response(&self) -> anyhow::Result<StreamResponse> {
        self.ready.notified().await;
        if self.config.failure == Some(StubFailure::Response) {
            bail!("stub: response failed");
        }
        Ok(self.config.response.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::RobotMode;

    fn request() -> ConnectRequest {
        ConnectRequest {
            url: "stub://local".into(),
            session_id: "s-1".into(),
            token: None,
            handler: None,
        }
    }

    fn audio() -> OutboundAudio {
        OutboundAudio {
            metadata: None,
            audio: vec![0; 4],
        }
    }

    #[tokio::test]
    async fn responds_after_configured_messages() {
        let transport = StubTransport::new(StubConfig {
            respond_after_messages: 2,
            ..StubConfig::default()
        });
        let conn = transport.connect(&request()).await.expect("connect");
        let stream = conn
            .open_stream(
                StreamKind::Intent(RobotMode::VoiceCommand),
                LanguageCode::EnglishUs,
            )
            .await
            .expect("open stream");

        stream.send_audio(audio()).await.expect("send 1");
        stream.send_audio(audio()).await.expect("send 2");
        let response = stream.wait_for_response().await.expect("response");
        assert_eq!(response, StubConfig::default().response);
    }

    #[tokio::test]
    async fn configured_failures_surface_in_their_phase() {
        let transport = StubTransport::new(StubConfig {
            failure: Some(StubFailure::Connect),
            ..StubConfig::default()
        });
        assert!(transport.connect(&request()).await.is_err());

        let transport = StubTransport::new(StubConfig {
            failure: Some(StubFailure::Send),
            ..StubConfig::default()
        });
        let conn = transport.connect(&request()).await.expect("connect");
        let stream = conn
            .open_stream(StreamKind::KnowledgeGraph, LanguageCode::German)
            .await
            .expect("open stream");
        assert!(stream.send_audio(audio()).await.is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let raw = r#"{"respondAfterMessages":3,"failure":"open_stream"}"#;
        let cfg: StubConfig = serde_json::from_str(raw).expect("stub config");
        assert_eq!(cfg.respond_after_messages, 3);
        assert_eq!(cfg.failure, Some(StubFailure::OpenStream));
        assert_eq!(cfg.response, StubConfig::default().response);
    }
}

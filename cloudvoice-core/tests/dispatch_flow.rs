use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cloudvoice_core::engine::DispatchDiagnostics;
use cloudvoice_core::session::KNOWLEDGE_GRAPH_ACTION;
use cloudvoice_core::transport::{
    AudioEncoder, CloudStream, ConnectRequest, Connection, IntentResponse,
    KnowledgeGraphResponse, OutboundAudio, StreamResponse,
};
use cloudvoice_core::{
    AudioSamples, Dispatcher, EngineConfig, ErrorKind, HotwordEvent, IntentMessage, IntentWriter,
    LanguageCode, Receiver, ReceiverControl, ReceiverEndpoint, ReceiverEvent, StreamKind,
    StreamType, TokenSource, Transport,
};

// ── Scripted transport ──────────────────────────────────────────────────────

/// Records connect / close calls and sent payloads, and answers with a fixed
/// response, optionally holding it back until the gate is opened.
#[derive(Clone)]
struct Scripted {
    log: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    response: StreamResponse,
    gate: Option<Arc<Notify>>,
    /// Sends fail from this message on (1-based).
    fail_send_from: Option<usize>,
}

impl Scripted {
    fn answering(response: StreamResponse) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            response,
            gate: None,
            fail_send_from: None,
        }
    }

    fn gated(response: StreamResponse) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut script = Self::answering(response);
        script.gate = Some(Arc::clone(&gate));
        (script, gate)
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn connect(&self, request: &ConnectRequest) -> anyhow::Result<Box<dyn Connection>> {
        self.log.lock().push(format!("connect:{}", request.session_id));
        Ok(Box::new(ScriptedConnection {
            script: self.clone(),
            session_id: request.session_id.clone(),
        }))
    }
}

struct ScriptedConnection {
    script: Scripted,
    session_id: String,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn open_stream(
        &self,
        _kind: StreamKind,
        _language: LanguageCode,
    ) -> anyhow::Result<Arc<dyn CloudStream>> {
        Ok(Arc::new(ScriptedStream {
            script: self.script.clone(),
            session_id: self.session_id.clone(),
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.script
            .log
            .lock()
            .push(format!("close_connection:{}", self.session_id));
        Ok(())
    }
}

struct ScriptedStream {
    script: Scripted,
    session_id: String,
}

#[async_trait]
impl CloudStream for ScriptedStream {
    async fn send_audio(&self, message: OutboundAudio) -> anyhow::Result<()> {
        let mut sent = self.script.sent.lock();
        sent.push(message.audio);
        match self.script.fail_send_from {
            Some(from) if sent.len() >= from => anyhow::bail!("stream reset"),
            _ => Ok(()),
        }
    }

    async fn wait_for_response(&self) -> anyhow::Result<StreamResponse> {
        if let Some(gate) = &self.script.gate {
            gate.notified().await;
        }
        Ok(self.script.response.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.script
            .log
            .lock()
            .push(format!("close_stream:{}", self.session_id));
        Ok(())
    }
}

struct EmptyToken;

impl TokenSource for EmptyToken {
    fn fetch_token(&self) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Passes PCM through and emits a one-byte trailer on flush.
struct TrailerEncoder;

impl AudioEncoder for TrailerEncoder {
    fn encode(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(pcm.to_vec())
    }

    fn flush(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0xEE])
    }
}

struct BrokenWriter;

impl IntentWriter for BrokenWriter {
    fn write(&self, _message: &IntentMessage) -> anyhow::Result<()> {
        anyhow::bail!("sink unavailable")
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

/// 10 ms chunks: 160 samples / 320 bytes each.
const CHUNK_SAMPLES: usize = 160;

fn config() -> EngineConfig {
    EngineConfig {
        service_url: "scripted://local".into(),
        chunk_duration: Duration::from_millis(10),
        verbose: true,
        ..EngineConfig::default()
    }
}

fn intent(action: &str) -> StreamResponse {
    StreamResponse::Intent(IntentResponse {
        action: action.into(),
        query_text: "what time is it".into(),
        confidence: 0.9,
        handler: "scripted".into(),
        ..IntentResponse::default()
    })
}

struct Harness {
    receiver: ReceiverEndpoint,
    intents: mpsc::Receiver<IntentMessage>,
    diagnostics: Arc<DispatchDiagnostics>,
    stop: CancellationToken,
    task: JoinHandle<cloudvoice_core::error::Result<()>>,
}

impl Harness {
    fn start(dispatcher: Dispatcher) -> Self {
        Self::start_with(dispatcher, config(), false)
    }

    fn start_with(mut dispatcher: Dispatcher, config: EngineConfig, is_test: bool) -> Self {
        let (receiver, endpoint) = Receiver::channel(32);
        dispatcher.register(receiver, is_test);
        let (intent_tx, intent_rx) = mpsc::channel(32);
        dispatcher.register_intent_writer(intent_tx);
        let diagnostics = dispatcher.diagnostics();
        let stop = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(config, stop.clone()));
        Self {
            receiver: endpoint,
            intents: intent_rx,
            diagnostics,
            stop,
            task,
        }
    }

    async fn send(&self, event: ReceiverEvent) {
        self.receiver.events.send(event).await.expect("dispatcher listening");
    }

    async fn hotword(&self, stream_type: StreamType, locale: &str) {
        self.send(ReceiverEvent::Hotword(HotwordEvent::new(stream_type, locale)))
            .await;
    }

    async fn audio(&self, chunks: usize) {
        self.send(ReceiverEvent::Audio(AudioSamples::new(vec![
            0;
            CHUNK_SAMPLES * chunks
        ])))
        .await;
    }

    async fn next_intent(&mut self) -> IntentMessage {
        tokio::time::timeout(Duration::from_secs(5), self.intents.recv())
            .await
            .expect("timed out waiting for intent writer")
            .expect("intent channel closed")
    }

    async fn next_control(&mut self) -> ReceiverControl {
        tokio::time::timeout(Duration::from_secs(5), self.receiver.control.recv())
            .await
            .expect("timed out waiting for write-back")
            .expect("control channel closed")
    }

    /// Stop the dispatcher and return every message still queued for the writer.
    async fn shutdown(mut self) -> Vec<IntentMessage> {
        self.stop.cancel();
        self.task
            .await
            .expect("dispatcher task panicked")
            .expect("dispatcher run");
        let mut rest = Vec::new();
        while let Some(message) = self.intents.recv().await {
            rest.push(message);
        }
        rest
    }
}

fn stream_open_id(message: IntentMessage) -> String {
    match message {
        IntentMessage::StreamOpen(open) => open.session_id,
        other => panic!("expected stream-open, got {other:?}"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hotword_streams_and_delivers_one_intent() {
    let script = Scripted::answering(intent("intent_clock_time"));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    h.hotword(StreamType::Normal, "en-US").await;
    h.audio(3).await;

    let session_id = stream_open_id(h.next_intent().await);
    match h.next_intent().await {
        IntentMessage::Intent(result) => {
            assert_eq!(result.action, "intent_clock_time");
            assert_eq!(result.session_id, session_id);
            assert!(result.parameters.is_none());
        }
        other => panic!("expected intent, got {other:?}"),
    }
    assert_eq!(h.next_control().await, ReceiverControl::StopListening);

    let diagnostics = Arc::clone(&h.diagnostics);
    let rest = h.shutdown().await;
    assert!(rest.is_empty(), "exactly one outcome per session: {rest:?}");

    let snap = diagnostics.snapshot();
    assert_eq!(snap.sessions_started, 1);
    assert_eq!(snap.streams_opened, 1);
    assert_eq!(snap.intents_delivered, 1);
    assert_eq!(snap.errors_delivered, 0);
    assert_eq!(
        script.log(),
        vec![
            format!("connect:{session_id}"),
            format!("close_stream:{session_id}"),
            format!("close_connection:{session_id}"),
        ]
    );
}

#[tokio::test]
async fn superseding_hotword_closes_first_session_before_next_connects() {
    let (script, _gate) = Scripted::gated(intent("intent_unused"));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    h.hotword(StreamType::Normal, "en-US").await;
    h.audio(1).await;
    let first = stream_open_id(h.next_intent().await);

    h.hotword(StreamType::Normal, "en-GB").await;
    let second = stream_open_id(h.next_intent().await);
    assert_ne!(first, second);

    assert_eq!(
        script.log(),
        vec![
            format!("connect:{first}"),
            format!("close_stream:{first}"),
            format!("close_connection:{first}"),
            format!("connect:{second}"),
        ]
    );

    let diagnostics = Arc::clone(&h.diagnostics);
    let rest = h.shutdown().await;
    assert!(rest.is_empty(), "superseded session must stay silent: {rest:?}");
    assert_eq!(diagnostics.snapshot().sessions_superseded, 1);
}

#[tokio::test]
async fn response_after_stop_is_discarded() {
    let (script, gate) = Scripted::gated(intent("intent_late"));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    h.hotword(StreamType::Normal, "en-US").await;
    h.audio(2).await;
    let session_id = stream_open_id(h.next_intent().await);

    let stop = h.stop.clone();
    stop.cancel();
    gate.notify_one();

    let rest = h.shutdown().await;
    assert!(rest.is_empty(), "no outcome after close: {rest:?}");
    assert!(script
        .log()
        .contains(&format!("close_stream:{session_id}")));
}

#[tokio::test]
async fn knowledge_graph_answer_is_normalized() {
    let script = Scripted::answering(StreamResponse::KnowledgeGraph(KnowledgeGraphResponse {
        answer: "About 384,400 km".into(),
        answer_type: "InformationAnswer".into(),
        query_text: "how far is the moon".into(),
        domains_used: vec!["astronomy".into(), "units".into()],
    }));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script)));

    h.hotword(StreamType::KnowledgeGraph, "en-AU").await;
    h.audio(1).await;

    stream_open_id(h.next_intent().await);
    match h.next_intent().await {
        IntentMessage::Intent(result) => {
            assert_eq!(result.action, KNOWLEDGE_GRAPH_ACTION);
            let params: std::collections::BTreeMap<String, String> =
                serde_json::from_str(result.parameters.as_deref().expect("parameters"))
                    .expect("parameter map");
            assert_eq!(params.len(), 5);
            assert_eq!(params["domains.0"], "astronomy");
            assert_eq!(params["domains.1"], "units");
        }
        other => panic!("expected knowledge-graph intent, got {other:?}"),
    }
    h.shutdown().await;
}

#[tokio::test]
async fn malformed_locale_and_unknown_stream_type_never_connect() {
    let script = Scripted::answering(intent("intent_unused"));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    for (stream_type, locale) in [
        (StreamType::Normal, "badlocale"),
        (StreamType::Unknown, "en-US"),
    ] {
        h.hotword(stream_type, locale).await;
        match h.next_intent().await {
            IntentMessage::Error(err) => assert_eq!(err.kind, ErrorKind::InvalidConfig),
            other => panic!("expected invalid config, got {other:?}"),
        }
        assert_eq!(h.next_control().await, ReceiverControl::StopListening);
    }

    // Audio after a rejected hotword has nowhere to go.
    h.audio(1).await;
    h.send(ReceiverEvent::Debug("marker".into())).await;
    assert_eq!(h.next_intent().await, IntentMessage::Debug("marker".into()));

    let diagnostics = Arc::clone(&h.diagnostics);
    h.shutdown().await;
    assert!(script.log().is_empty());
    let snap = diagnostics.snapshot();
    assert_eq!(snap.sessions_started, 0);
    assert_eq!(snap.errors_delivered, 2);
    assert_eq!(snap.audio_discarded, 1);
}

#[tokio::test]
async fn missing_required_token_is_reported_before_connecting() {
    let script = Scripted::answering(intent("intent_unused"));
    let dispatcher =
        Dispatcher::new(Arc::new(script.clone())).with_token_source(Arc::new(EmptyToken));
    let config = EngineConfig {
        require_token: true,
        ..config()
    };
    let mut h = Harness::start_with(dispatcher, config, false);

    h.hotword(StreamType::Normal, "en-US").await;
    match h.next_intent().await {
        IntentMessage::Error(err) => assert_eq!(err.kind, ErrorKind::Token),
        other => panic!("expected token error, got {other:?}"),
    }
    h.shutdown().await;
    assert!(script.log().is_empty());
}

#[tokio::test]
async fn test_source_hotword_notifies_every_receiver() {
    let script = Scripted::answering(intent("intent_unused"));
    let mut dispatcher = Dispatcher::new(Arc::new(script));
    let (other, mut other_endpoint) = Receiver::channel(4);
    dispatcher.register(other, false);
    let mut h = Harness::start_with(dispatcher, config(), true);

    h.hotword(StreamType::Normal, "en-US").await;

    assert_eq!(h.next_control().await, ReceiverControl::TestStarted);
    let other_control = tokio::time::timeout(Duration::from_secs(5), other_endpoint.control.recv())
        .await
        .expect("timed out")
        .expect("control channel");
    assert_eq!(other_control, ReceiverControl::TestStarted);
    h.shutdown().await;
}

#[tokio::test]
async fn failing_writer_does_not_starve_the_others() {
    let script = Scripted::answering(intent("intent_weather"));
    let mut dispatcher = Dispatcher::new(Arc::new(script));
    dispatcher.register_intent_writer(BrokenWriter);
    let mut h = Harness::start(dispatcher);

    h.hotword(StreamType::Blackjack, "fr-FR").await;
    h.audio(1).await;

    stream_open_id(h.next_intent().await);
    assert!(matches!(h.next_intent().await, IntentMessage::Intent(_)));

    let diagnostics = Arc::clone(&h.diagnostics);
    h.shutdown().await;
    // stream-open + intent, both rejected by the broken writer
    assert_eq!(diagnostics.snapshot().writer_failures, 2);
}

#[tokio::test]
async fn end_of_audio_flushes_encoder_and_still_delivers() {
    let (script, gate) = Scripted::gated(intent("intent_clock_time"));
    let dispatcher = Dispatcher::new(Arc::new(script.clone()))
        .with_encoder(Arc::new(|| Box::new(TrailerEncoder) as Box<dyn AudioEncoder>));
    let config = EngineConfig {
        compress: true,
        ..config()
    };
    let mut h = Harness::start_with(dispatcher, config, false);

    h.hotword(StreamType::Normal, "en-US").await;
    // one full chunk plus a half chunk that is never sent
    h.send(ReceiverEvent::Audio(AudioSamples::new(vec![
        1;
        CHUNK_SAMPLES + CHUNK_SAMPLES / 2
    ])))
    .await;
    h.send(ReceiverEvent::EndOfAudio).await;
    stream_open_id(h.next_intent().await);

    for _ in 0..200 {
        if script.sent.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    {
        let sent = script.sent.lock();
        assert_eq!(sent.len(), 2, "one chunk then the encoder trailer");
        assert_eq!(sent[0].len(), CHUNK_SAMPLES * 2);
        assert_eq!(sent[1], vec![0xEE]);
    }

    gate.notify_one();
    assert!(matches!(h.next_intent().await, IntentMessage::Intent(_)));
    h.shutdown().await;
}

#[tokio::test]
async fn end_of_audio_without_a_session_is_ignored() {
    let script = Scripted::answering(intent("intent_unused"));
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    h.send(ReceiverEvent::EndOfAudio).await;
    h.send(ReceiverEvent::Debug("after".into())).await;
    assert_eq!(h.next_intent().await, IntentMessage::Debug("after".into()));

    let rest = h.shutdown().await;
    assert!(rest.is_empty());
    assert!(script.log().is_empty());
}

#[tokio::test]
async fn send_failure_racing_a_response_reaches_writers_once() {
    let mut script = Scripted::answering(intent("intent_weather"));
    script.fail_send_from = Some(2);
    let mut h = Harness::start(Dispatcher::new(Arc::new(script.clone())));

    h.hotword(StreamType::Normal, "en-US").await;
    h.audio(4).await;

    stream_open_id(h.next_intent().await);
    match h.next_intent().await {
        IntentMessage::Intent(result) => assert_eq!(result.action, "intent_weather"),
        IntentMessage::Error(err) => assert_eq!(err.kind, ErrorKind::Server),
        other => panic!("expected a terminal message, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let diagnostics = Arc::clone(&h.diagnostics);
    let rest = h.shutdown().await;
    assert!(rest.is_empty(), "exactly one terminal message: {rest:?}");
    let snap = diagnostics.snapshot();
    assert_eq!(snap.intents_delivered + snap.errors_delivered, 1);
}

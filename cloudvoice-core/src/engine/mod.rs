//! `Dispatcher`: the single coordinating loop.
//!
//! ## Lifecycle
//!
//! ```text
//! Dispatcher::new(transport)
//!     └─► register(receiver, is_test)     → forwarding task spawned
//!     └─► register_intent_writer(writer)
//!         └─► run(config, stop)           → dispatch until `stop` fires
//! ```
//!
//! Registrations happen before `run`, which consumes the dispatcher, so the
//! receiver and writer lists need no locking while dispatching.
//!
//! ## Loop
//!
//! Each iteration waits on the stop token, the active session's event
//! channel, and the inbound queue fed by the forwarding tasks, then handles
//! exactly one of them. Fan-out to writers and receivers happens inline;
//! both traits are synchronous and the provided implementations never block.

pub mod diagnostics;
pub mod receiver;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffering::ChunkSpec,
    error::{CloudVoiceError, Result},
    ipc::events::{
        AudioSamples, ErrorResponse, HotwordEvent, IntentMessage, ReceiverControl, ReceiverEvent,
        StreamOpenEvent,
    },
    resolve::{resolve_language, resolve_mode, LanguageCode, StreamKind},
    session::{SessionEvent, SessionHandle, SessionOptions, StreamingSession},
    transport::{EncoderFactory, TokenSource, Transport},
};

pub use diagnostics::{DiagnosticsSnapshot, DispatchDiagnostics};
pub use receiver::{ControlWriter, IntentWriter, Receiver, ReceiverEndpoint};

use receiver::{forward, Inbound};

/// Inbound queue capacity shared by all forwarding tasks.
const INBOUND_CAP: usize = 256;

pub const DEFAULT_SERVICE_URL: &str = "voice.cloudvoice.dev:443";

/// Per-run dispatch options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address of the cloud speech/intent service.
    pub service_url: String,
    /// Optional server-side handler selection, passed through on connect.
    pub handler: Option<String>,
    /// Default: 16000.
    pub sample_rate: u32,
    /// Default: 2 (16-bit PCM).
    pub bytes_per_sample: u32,
    /// Audio duration per transmitted chunk. Default: 120 ms.
    pub chunk_duration: Duration,
    /// Deadline for a whole session, measured from connect. Default: 9 s.
    pub session_timeout: Duration,
    /// Compress audio with the encoder given to `Dispatcher::with_encoder`.
    pub compress: bool,
    /// Fail sessions with a `Token` error when no token could be fetched.
    pub require_token: bool,
    /// Per-chunk and discarded-audio logging.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.into(),
            handler: None,
            sample_rate: 16_000,
            bytes_per_sample: 2,
            chunk_duration: Duration::from_millis(120),
            session_timeout: Duration::from_secs(9),
            compress: false,
            require_token: false,
            verbose: false,
        }
    }
}

impl EngineConfig {
    pub fn chunk_spec(&self) -> ChunkSpec {
        ChunkSpec::new(self.sample_rate, self.bytes_per_sample, self.chunk_duration)
    }
}

struct RegisteredReceiver {
    source: usize,
    is_test: bool,
    control: Box<dyn ControlWriter>,
}

struct ActiveSession {
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
}

enum Step {
    Stop,
    Session(SessionEvent),
    Inbound(Inbound),
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    token_source: Option<Arc<dyn TokenSource>>,
    encoder: Option<EncoderFactory>,
    receivers: Vec<RegisteredReceiver>,
    writers: Vec<Box<dyn IntentWriter>>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    /// Fired on exit; every forwarding task observes it.
    forwarders: CancellationToken,
    active: Option<ActiveSession>,
    diagnostics: Arc<DispatchDiagnostics>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAP);
        Self {
            transport,
            token_source: None,
            encoder: None,
            receivers: Vec::new(),
            writers: Vec::new(),
            inbound_tx,
            inbound_rx,
            forwarders: CancellationToken::new(),
            active: None,
            diagnostics: Arc::new(DispatchDiagnostics::default()),
        }
    }

    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Encoder used for every session when `EngineConfig::compress` is set.
    pub fn with_encoder(mut self, factory: EncoderFactory) -> Self {
        self.encoder = Some(factory);
        self
    }

    /// Add a receiver and start relaying its events.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn register(&mut self, receiver: Receiver, is_test: bool) {
        let source = self.receivers.len();
        let (events, control) = receiver.into_parts();
        tokio::spawn(forward(
            source,
            is_test,
            events,
            self.inbound_tx.clone(),
            self.forwarders.clone(),
        ));
        self.receivers.push(RegisteredReceiver {
            source,
            is_test,
            control,
        });
        debug!(source, is_test, "receiver registered");
    }

    pub fn register_intent_writer(&mut self, writer: impl IntentWriter + 'static) {
        self.writers.push(Box::new(writer));
    }

    /// Shared counters; stays readable after `run` consumes the dispatcher.
    pub fn diagnostics(&self) -> Arc<DispatchDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Dispatch events until `stop` fires.
    ///
    /// # Errors
    /// `CloudVoiceError::InvalidConfig` if compression is requested without
    /// an encoder. Nothing that happens during dispatch is returned here.
    pub async fn run(mut self, config: EngineConfig, stop: CancellationToken) -> Result<()> {
        if config.compress && self.encoder.is_none() {
            return Err(CloudVoiceError::InvalidConfig(
                "compression enabled but no audio encoder configured".into(),
            ));
        }
        self.diagnostics.reset();
        info!(
            receivers = self.receivers.len(),
            writers = self.writers.len(),
            url = %config.service_url,
            "dispatcher running"
        );

        loop {
            let step = tokio::select! {
                biased;
                _ = stop.cancelled() => Step::Stop,
                event = next_session_event(&mut self.active) => Step::Session(event),
                Some(inbound) = self.inbound_rx.recv() => Step::Inbound(inbound),
            };

            match step {
                Step::Stop => break,
                Step::Session(event) => self.on_session_event(event).await,
                Step::Inbound(Inbound {
                    source,
                    is_test,
                    event,
                }) => match event {
                    ReceiverEvent::Hotword(hotword) => {
                        self.on_hotword(&config, source, is_test, hotword).await
                    }
                    ReceiverEvent::Audio(samples) => self.on_audio(&config, &samples),
                    ReceiverEvent::Debug(text) => self.write_intents(&IntentMessage::Debug(text)),
                    ReceiverEvent::EndOfAudio => self.on_end_of_audio(source),
                },
            }
        }

        self.forwarders.cancel();
        self.close_active("dispatcher stopping").await;
        info!("dispatcher stopped");
        Ok(())
    }

    async fn on_hotword(
        &mut self,
        config: &EngineConfig,
        source: usize,
        is_test: bool,
        hotword: HotwordEvent,
    ) {
        if self.active.is_some() {
            warn!(source, "hotword while a session is active; closing it first");
            DispatchDiagnostics::bump(&self.diagnostics.sessions_superseded);
            self.close_active("superseded by hotword").await;
        }

        if is_test {
            self.write_receivers(ReceiverControl::TestStarted);
        }

        let resolved = resolve_mode(hotword.stream_type)
            .and_then(|kind| Ok((kind, resolve_language(&hotword.locale)?)));
        let (kind, language) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(source, locale = %hotword.locale, error = %e, "cannot start session");
                self.deliver_error(&e);
                return;
            }
        };

        let options = self.session_options(config, kind, language);
        let (handle, events) = StreamingSession::start(
            options,
            Arc::clone(&self.transport),
            self.token_source.clone(),
        );
        info!(
            session_id = handle.session_id(),
            source,
            ?kind,
            ?language,
            "session started"
        );
        DispatchDiagnostics::bump(&self.diagnostics.sessions_started);
        self.active = Some(ActiveSession { handle, events });
    }

    fn on_audio(&self, config: &EngineConfig, samples: &AudioSamples) {
        match &self.active {
            Some(active) if active.handle.push_audio(samples.to_le_bytes()) => {
                DispatchDiagnostics::bump(&self.diagnostics.audio_forwarded);
            }
            _ => {
                DispatchDiagnostics::bump(&self.diagnostics.audio_discarded);
                if config.verbose {
                    debug!(samples = samples.samples.len(), "no active session; audio discarded");
                }
            }
        }
    }

    fn on_end_of_audio(&mut self, source: usize) {
        match self.active.as_mut() {
            Some(active) => {
                debug!(source, session_id = active.handle.session_id(), "end of audio");
                active.handle.finish_audio();
            }
            None => debug!(source, "end of audio with no active session"),
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened { session_id } => {
                if !self.is_active(&session_id) {
                    return;
                }
                DispatchDiagnostics::bump(&self.diagnostics.streams_opened);
                self.write_intents(&IntentMessage::StreamOpen(StreamOpenEvent { session_id }));
            }
            SessionEvent::Outcome { session_id, result } => {
                if !self.is_active(&session_id) {
                    debug!(%session_id, "outcome from a stale session ignored");
                    return;
                }
                match result {
                    Ok(intent) => {
                        info!(%session_id, action = %intent.action, "intent received");
                        DispatchDiagnostics::bump(&self.diagnostics.intents_delivered);
                        self.write_receivers(ReceiverControl::StopListening);
                        self.write_intents(&IntentMessage::Intent(intent));
                    }
                    Err(e) => {
                        warn!(%session_id, error = %e, "session failed");
                        self.deliver_error(&e);
                    }
                }
                self.close_active("outcome delivered").await;
            }
        }
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.handle.session_id() == session_id)
    }

    fn session_options(
        &self,
        config: &EngineConfig,
        kind: StreamKind,
        language: LanguageCode,
    ) -> SessionOptions {
        SessionOptions {
            url: config.service_url.clone(),
            handler: config.handler.clone(),
            kind,
            language,
            chunk: config.chunk_spec(),
            timeout: config.session_timeout,
            require_token: config.require_token,
            encoder: if config.compress {
                self.encoder.clone()
            } else {
                None
            },
            verbose: config.verbose,
        }
    }

    fn deliver_error(&self, err: &CloudVoiceError) {
        DispatchDiagnostics::bump(&self.diagnostics.errors_delivered);
        self.write_receivers(ReceiverControl::StopListening);
        self.write_intents(&IntentMessage::Error(ErrorResponse {
            kind: err.kind(),
            message: err.to_string(),
        }));
    }

    async fn close_active(&mut self, reason: &str) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let session_id = active.handle.session_id().to_string();
        match active.handle.close().await {
            Ok(()) => debug!(%session_id, reason, "session closed"),
            Err(e) => warn!(%session_id, reason, "closing session: {e}"),
        }
    }

    fn write_receivers(&self, control: ReceiverControl) {
        for receiver in &self.receivers {
            if let Err(e) = receiver.control.write(control) {
                DispatchDiagnostics::bump(&self.diagnostics.write_back_failures);
                warn!(
                    source = receiver.source,
                    is_test = receiver.is_test,
                    ?control,
                    "receiver write-back failed: {e:#}"
                );
            }
        }
    }

    fn write_intents(&self, message: &IntentMessage) {
        for (index, writer) in self.writers.iter().enumerate() {
            if let Err(e) = writer.write(message) {
                DispatchDiagnostics::bump(&self.diagnostics.writer_failures);
                warn!(writer = index, "intent writer failed: {e:#}");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.forwarders.cancel();
    }
}

/// Next event of the active session; pending forever when there is none.
async fn next_session_event(active: &mut Option<ActiveSession>) -> SessionEvent {
    match active {
        Some(active) => match active.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

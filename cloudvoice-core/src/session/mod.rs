//! Streaming session: one connection + stream pair to the cloud service.
//!
//! ## States
//!
//! ```text
//! Connecting ──ok──► Streaming ──close()──► Closed
//!      │                                       ▲
//!      └──────── token / connect / stream error┘
//! ```
//!
//! ## Tasks (per session)
//!
//! | Task | Owns | Ends when |
//! |------|------|-----------|
//! | buffer | pending audio bytes | cancelled, or intake closed and drained |
//! | drive (connect, then send) | encoder, first-message metadata | cancelled, send error, chunk stream ends |
//! | response | nothing | terminal response / error / cancelled |
//! | deadline | nothing | deadline passes, outcome delivered, or cancelled |
//!
//! Every outcome goes through `Shared::deliver`, which drops it if the
//! session was already closed and otherwise lets only the first one through.
//! Close and deadline expiry both cancel the same `CancellationToken`.

pub mod latch;
pub mod response;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffering::{buffer_stage, AudioIntake, ChunkReceiver, ChunkSpec},
    error::{CloudVoiceError, Result},
    ipc::events::IntentResult,
    resolve::{LanguageCode, StreamKind},
    transport::{
        AudioEncoder, CloudStream, ConnectRequest, Connection, EncoderFactory, OutboundAudio,
        StreamMetadata, TokenSource, Transport,
    },
};

pub use latch::OutcomeLatch;
pub use response::{normalize, CONNECTION_CHECK_ACTION, KNOWLEDGE_GRAPH_ACTION};

/// Opened + one outcome.
const SESSION_EVENT_CAP: usize = 2;

/// Everything a session needs, resolved by the dispatcher at hotword time.
#[derive(Clone)]
pub struct SessionOptions {
    pub url: String,
    pub handler: Option<String>,
    pub kind: StreamKind,
    pub language: LanguageCode,
    pub chunk: ChunkSpec,
    pub timeout: Duration,
    pub require_token: bool,
    pub encoder: Option<EncoderFactory>,
    pub verbose: bool,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("url", &self.url)
            .field("handler", &self.handler)
            .field("kind", &self.kind)
            .field("language", &self.language)
            .field("chunk", &self.chunk)
            .field("timeout", &self.timeout)
            .field("require_token", &self.require_token)
            .field("compressed", &self.encoder.is_some())
            .finish()
    }
}

/// Notifications a session sends back to the dispatcher.
#[derive(Debug)]
pub enum SessionEvent {
    /// The typed stream is open. Sent at most once, before any outcome.
    Opened { session_id: String },
    /// The single terminal outcome.
    Outcome {
        session_id: String,
        result: Result<IntentResult>,
    },
}

struct Link {
    connection: Box<dyn Connection>,
    stream: Arc<dyn CloudStream>,
}

impl Link {
    /// Close stream then connection, attempting both.
    async fn close(self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        if let Err(e) = self.stream.close().await {
            errors.push(e.context("closing stream"));
        }
        if let Err(e) = self.connection.close().await {
            errors.push(e.context("closing connection"));
        }
        errors
    }
}

struct Shared {
    session_id: String,
    closed: AtomicBool,
    cancel: CancellationToken,
    latch: OutcomeLatch,
    events: mpsc::Sender<SessionEvent>,
    link: Mutex<Option<Link>>,
    verbose: bool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, result: Result<IntentResult>) {
        if self.is_closed() {
            info!(
                session_id = %self.session_id,
                "session already closed; discarding outcome"
            );
            return;
        }
        if !self.latch.try_fire() {
            debug!(
                session_id = %self.session_id,
                "outcome already delivered; discarding"
            );
            return;
        }
        let event = SessionEvent::Outcome {
            session_id: self.session_id.clone(),
            result,
        };
        if self.events.try_send(event).is_err() {
            warn!(session_id = %self.session_id, "dispatcher stopped listening");
        }
    }
}

/// Dispatcher-side handle to a running session.
pub struct SessionHandle {
    shared: Arc<Shared>,
    intake: Option<AudioIntake>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.shared.session_id)
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Hand raw bytes to the buffer stage. Never blocks.
    ///
    /// Returns `false` if the stage is gone (session closed or audio finished).
    pub fn push_audio(&self, bytes: Vec<u8>) -> bool {
        match &self.intake {
            Some(intake) => intake.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Signal end of audio: buffered full chunks are still sent, then the
    /// encoder is flushed and the session keeps waiting for its response.
    pub fn finish_audio(&mut self) {
        self.intake = None;
    }

    /// Close the session: mark closed, cancel every task, then close the
    /// stream and the connection.
    ///
    /// # Errors
    /// Combines whatever the stream and connection close calls returned.
    pub async fn close(&mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        self.intake = None;

        let link = self.shared.link.lock().take();
        let Some(link) = link else {
            debug!(session_id = %self.shared.session_id, "closed before stream opened");
            return Ok(());
        };

        let errors = link.close().await;
        if errors.is_empty() {
            debug!(session_id = %self.shared.session_id, "session closed");
            return Ok(());
        }
        let detail = errors
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(CloudVoiceError::Other(anyhow::anyhow!(detail)))
    }
}

/// Entry point: start a session without waiting for it to connect.
pub struct StreamingSession;

impl StreamingSession {
    /// Spawn the buffer and drive tasks for a new session.
    ///
    /// Returns the handle plus the receiver for this session's events.
    pub fn start(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAP);

        let shared = Arc::new(Shared {
            session_id,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            latch: OutcomeLatch::new(),
            events: events_tx,
            link: Mutex::new(None),
            verbose: options.verbose,
        });

        let (intake, stage, chunks) = buffer_stage(options.chunk.chunk_bytes(), cancel);
        tokio::spawn(stage.run());
        tokio::spawn(drive(
            Arc::clone(&shared),
            options,
            transport,
            token_source,
            chunks,
        ));

        (
            SessionHandle {
                shared,
                intake: Some(intake),
            },
            events_rx,
        )
    }
}

/// A send/response failure is a timeout if the deadline has passed, otherwise
/// a server error.
pub fn classify_failure(err: &anyhow::Error, deadline: Instant) -> CloudVoiceError {
    if Instant::now() >= deadline {
        CloudVoiceError::Timeout(format!("{err:#}"))
    } else {
        CloudVoiceError::Server(format!("{err:#}"))
    }
}

async fn drive(
    shared: Arc<Shared>,
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    token_source: Option<Arc<dyn TokenSource>>,
    chunks: ChunkReceiver,
) {
    let deadline = Instant::now() + options.timeout;

    let connected = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return,
        r = connect(&shared, &options, transport.as_ref(), token_source, deadline) => r,
    };
    let link = match connected {
        Ok(link) => link,
        Err(e) => {
            warn!(session_id = %shared.session_id, error = %e, "session failed to connect");
            shared.deliver(Err(e));
            return;
        }
    };

    let stream = Arc::clone(&link.stream);
    let rejected = {
        let mut slot = shared.link.lock();
        if shared.is_closed() {
            Some(link)
        } else {
            *slot = Some(link);
            None
        }
    };
    if let Some(link) = rejected {
        for e in link.close().await {
            debug!(session_id = %shared.session_id, "late close: {e:#}");
        }
        return;
    }

    info!(session_id = %shared.session_id, kind = ?options.kind, "stream open");
    let opened = SessionEvent::Opened {
        session_id: shared.session_id.clone(),
    };
    if shared.events.try_send(opened).is_err() {
        warn!(session_id = %shared.session_id, "dispatcher stopped listening");
    }
    tokio::spawn(expire_at(Arc::clone(&shared), deadline));

    let metadata = StreamMetadata {
        session_id: shared.session_id.clone(),
        kind: options.kind,
        language: options.language,
        sample_rate: options.chunk.sample_rate,
        compressed: options.encoder.is_some(),
        handler: options.handler.clone(),
    };
    let sender = SendTask {
        shared,
        stream,
        deadline,
        metadata: Some(metadata),
        response_started: false,
        sent: 0,
    };
    sender
        .run(chunks, options.encoder.as_ref().map(|factory| factory()))
        .await;
}

async fn connect(
    shared: &Shared,
    options: &SessionOptions,
    transport: &dyn Transport,
    token_source: Option<Arc<dyn TokenSource>>,
    deadline: Instant,
) -> Result<Link> {
    let token = match token_source {
        Some(source) => fetch_token(source).await,
        None => Ok(None),
    };
    let token = match (token, options.require_token) {
        (Ok(Some(token)), _) => Some(token),
        (Ok(None), true) => {
            return Err(CloudVoiceError::Token("token source returned no token".into()))
        }
        (Err(e), true) => return Err(CloudVoiceError::Token(format!("{e:#}"))),
        (Err(e), false) => {
            warn!("token fetch failed, continuing without credentials: {e:#}");
            None
        }
        (Ok(None), false) => None,
    };

    let request = ConnectRequest {
        url: options.url.clone(),
        session_id: shared.session_id.clone(),
        token,
        handler: options.handler.clone(),
    };
    debug!(session_id = %request.session_id, url = %request.url, "connecting");

    let connection = timeout_at(deadline, transport.connect(&request))
        .await
        .map_err(|_| CloudVoiceError::Connecting("deadline exceeded".into()))?
        .map_err(|e| CloudVoiceError::Connecting(format!("{e:#}")))?;

    let opened = timeout_at(deadline, connection.open_stream(options.kind, options.language)).await;
    let stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            close_quietly(connection.as_ref()).await;
            return Err(CloudVoiceError::NewStream(format!("{e:#}")));
        }
        Err(_) => {
            close_quietly(connection.as_ref()).await;
            return Err(CloudVoiceError::NewStream("deadline exceeded".into()));
        }
    };

    Ok(Link { connection, stream })
}

/// Empty tokens count as no token.
async fn fetch_token(source: Arc<dyn TokenSource>) -> anyhow::Result<Option<String>> {
    let token = tokio::task::spawn_blocking(move || source.fetch_token()).await??;
    Ok(Some(token).filter(|t| !t.is_empty()))
}

async fn close_quietly(connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        debug!("closing connection after failed stream: {e:#}");
    }
}

struct SendTask {
    shared: Arc<Shared>,
    stream: Arc<dyn CloudStream>,
    deadline: Instant,
    metadata: Option<StreamMetadata>,
    response_started: bool,
    sent: usize,
}

impl SendTask {
    async fn run(
        mut self,
        mut chunks: ChunkReceiver,
        mut encoder: Option<Box<dyn AudioEncoder>>,
    ) {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break,
                chunk = chunks.recv() => chunk,
            };

            let Some(chunk) = chunk else {
                // Intake finished: push out whatever the encoder still holds.
                if let Some(encoder) = encoder.as_mut() {
                    match encoder.flush() {
                        Ok(tail) if !tail.is_empty() => {
                            self.send(tail).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(session_id = %self.shared.session_id, "encoder flush: {e:#}"),
                    }
                }
                debug!(session_id = %self.shared.session_id, sent = self.sent, "audio finished");
                break;
            };

            let audio = match encoder.as_mut() {
                Some(encoder) => match encoder.encode(&chunk) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        self.shared
                            .deliver(Err(CloudVoiceError::Server(format!("encoding audio: {e:#}"))));
                        break;
                    }
                },
                None => chunk,
            };

            if !self.send(audio).await {
                break;
            }
        }
    }

    /// Transmit one message. Returns `false` once the send task must stop.
    async fn send(&mut self, audio: Vec<u8>) -> bool {
        let bytes = audio.len();
        let message = OutboundAudio {
            metadata: self.metadata.take(),
            audio,
        };

        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return false,
            r = timeout_at(self.deadline, self.stream.send_audio(message)) => r,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = classify_failure(&e, self.deadline);
                warn!(session_id = %self.shared.session_id, error = %err, "send failed");
                self.shared.deliver(Err(err));
                return false;
            }
            Err(_) => {
                warn!(session_id = %self.shared.session_id, "send hit session deadline");
                self.shared
                    .deliver(Err(CloudVoiceError::Timeout("sending audio".into())));
                return false;
            }
        }

        self.sent += 1;
        if self.shared.verbose {
            debug!(session_id = %self.shared.session_id, sent = self.sent, bytes, "chunk sent");
        }

        if !self.response_started {
            self.response_started = true;
            tokio::spawn(await_response(
                Arc::clone(&self.shared),
                Arc::clone(&self.stream),
                self.deadline,
            ));
        }
        true
    }
}

/// Bounds the session even when no audio is ever sent.
async fn expire_at(shared: Arc<Shared>, deadline: Instant) {
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return,
        _ = tokio::time::sleep_until(deadline) => {}
    }
    if shared.latch.has_fired() {
        return;
    }
    warn!(session_id = %shared.session_id, "session deadline passed without a response");
    shared.deliver(Err(CloudVoiceError::Timeout("no response before deadline".into())));
}

async fn await_response(shared: Arc<Shared>, stream: Arc<dyn CloudStream>, deadline: Instant) {
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            debug!(session_id = %shared.session_id, "cancelled while awaiting response");
            return;
        }
        r = timeout_at(deadline, stream.wait_for_response()) => r,
    };

    let outcome = match result {
        Ok(Ok(response)) => normalize(&shared.session_id, response),
        Ok(Err(e)) => Err(classify_failure(&e, deadline)),
        Err(_) => Err(CloudVoiceError::Timeout("waiting for response".into())),
    };
    match &outcome {
        Ok(intent) => info!(session_id = %shared.session_id, action = %intent.action, "response received"),
        Err(e) => warn!(session_id = %shared.session_id, error = %e, "response failed"),
    }
    shared.deliver(outcome);
}

//! `cloudvoice`: runs the session dispatcher against a recorded utterance.
//!
//! ```text
//! cloudvoice [--settings <file.json>] <utterance.wav>
//! ```
//!
//! The recording is played as a single receiver that fires one hotword and
//! then streams its audio. Every message the dispatcher emits is printed to
//! stdout as a JSON line; logs go to stderr. The process exits after the
//! first intent or error, or on Ctrl-C.

mod settings;
mod source;
mod token;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cloudvoice_core::{Dispatcher, Receiver, StubTransport};
use settings::{default_settings_path, load_settings};
use source::{read_wav_mono_i16, PlaybackOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use writer::{JsonLinesWriter, StopOnOutcome};

/// Room for a few seconds of 20 ms frames ahead of the dispatcher.
const SOURCE_QUEUE_CAP: usize = 128;

#[derive(Debug)]
struct Args {
    settings: Option<PathBuf>,
    recording: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut settings = None;
    let mut recording = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err(anyhow!("missing value for --settings"));
                };
                settings = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!("Usage: cloudvoice [--settings <file.json>] <utterance.wav>");
                std::process::exit(0);
            }
            other if other.starts_with('-') => return Err(anyhow!("unknown flag {other}")),
            other => recording = Some(PathBuf::from(other)),
        }
    }

    Ok(Args {
        settings,
        recording: recording.ok_or_else(|| anyhow!("missing recording path"))?,
    })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Usage: cloudvoice [--settings <file.json>] <utterance.wav>");
            std::process::exit(2);
        }
    };

    // ── Tracing ───────────────────────────────────────────────────────────
    // Before settings load: `load_settings` logs through it.
    let from_env = EnvFilter::try_from_default_env().ok();
    let has_env_filter = from_env.is_some();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(from_env.unwrap_or_else(|| EnvFilter::new("cloudvoice=info")))
        .with_filter_reloading();
    let filter = builder.reload_handle();
    builder.init();

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();

    if settings.verbose && !has_env_filter {
        if let Err(e) = filter.reload(EnvFilter::new("cloudvoice=debug")) {
            warn!("cannot raise log level: {e}");
        }
    }

    info!(path = %settings_path.display(), "cloudvoice starting");
    if let Err(e) = run(args, settings).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args, settings: settings::AppSettings) -> anyhow::Result<()> {
    let config = settings.engine_config();
    let clip = read_wav_mono_i16(&args.recording)?;
    info!(
        samples = clip.samples.len(),
        sample_rate = clip.sample_rate,
        "recording loaded"
    );

    let mut dispatcher = Dispatcher::new(Arc::new(StubTransport::new(settings.stub.clone())));
    if let Some(url) = &settings.token_url {
        dispatcher = dispatcher.with_token_source(Arc::new(token::HttpTokenSource::new(url.as_str())));
    }

    let stop = CancellationToken::new();
    let (receiver, endpoint) = Receiver::channel(SOURCE_QUEUE_CAP);
    dispatcher.register(receiver, false);
    dispatcher.register_intent_writer(JsonLinesWriter::stdout());
    dispatcher.register_intent_writer(StopOnOutcome::new(stop.clone()));
    let diagnostics = dispatcher.diagnostics();

    let playback = PlaybackOptions {
        stream_type: settings.stream_type,
        locale: settings.locale.clone(),
        frame_ms: settings.frame_ms,
        realtime: settings.realtime,
    };
    let source_stop = stop.clone();
    let sample_rate = config.sample_rate;
    let source = tokio::spawn(async move {
        let played = source::play(clip, sample_rate, playback, endpoint).await;
        if played.is_err() {
            source_stop.cancel();
        }
        played
    });

    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            interrupt.cancel();
        }
    });

    dispatcher.run(config, stop).await?;
    source.await.context("recording task panicked")??;

    info!(diagnostics = ?diagnostics.snapshot(), "cloudvoice finished");
    Ok(())
}

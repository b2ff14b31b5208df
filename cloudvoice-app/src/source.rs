//! WAV-file receiver: plays a recording into the dispatcher as if it were a
//! microphone that just heard the hotword.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use cloudvoice_core::{
    AudioSamples, HotwordEvent, ReceiverControl, ReceiverEndpoint, ReceiverEvent, StreamType,
};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct WavClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Read a PCM WAV file, down-mixing to mono 16-bit.
pub fn read_wav_mono_i16(path: &Path) -> anyhow::Result<WavClip> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("decoding samples")?,
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample - 16;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<Vec<_>, _>>()
                .context("decoding samples")?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<Result<Vec<_>, _>>()
            .context("decoding samples")?,
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    };

    Ok(WavClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub stream_type: StreamType,
    pub locale: String,
    pub frame_ms: u64,
    pub realtime: bool,
}

/// Fire a hotword, then stream the clip frame by frame until it runs out or
/// the dispatcher asks us to stop listening. A clip that runs out is followed
/// by `EndOfAudio`.
pub async fn play(
    clip: WavClip,
    expected_rate: u32,
    options: PlaybackOptions,
    mut endpoint: ReceiverEndpoint,
) -> anyhow::Result<()> {
    if clip.sample_rate != expected_rate {
        bail!(
            "recording is {} Hz but the service expects {} Hz",
            clip.sample_rate,
            expected_rate
        );
    }
    let frame_samples =
        ((u64::from(expected_rate) * options.frame_ms) / 1_000).max(1) as usize;
    let frame_period = Duration::from_millis(options.frame_ms);

    endpoint
        .events
        .send(ReceiverEvent::Hotword(HotwordEvent::new(
            options.stream_type,
            options.locale.clone(),
        )))
        .await
        .context("dispatcher gone before hotword")?;

    let mut ticker = tokio::time::interval(frame_period);
    let mut frames = 0usize;
    for frame in clip.samples.chunks(frame_samples) {
        match endpoint.control.try_recv() {
            Ok(ReceiverControl::StopListening) => {
                info!(frames, "stop listening requested");
                return Ok(());
            }
            Ok(ReceiverControl::TestStarted) | Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Ok(()),
        }
        if options.realtime {
            ticker.tick().await;
        }
        let event = ReceiverEvent::Audio(AudioSamples::new(frame.to_vec()));
        if endpoint.events.send(event).await.is_err() {
            return Ok(());
        }
        frames += 1;
    }
    debug!(frames, "recording exhausted");
    if endpoint.events.send(ReceiverEvent::EndOfAudio).await.is_err() {
        debug!("dispatcher gone before end of audio");
    }
    Ok(())
}

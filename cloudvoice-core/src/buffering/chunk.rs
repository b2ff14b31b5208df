//! Chunk sizing and the pending-audio accumulator.

use std::time::Duration;

/// Chunk geometry: how many raw bytes make one transmission unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub sample_rate: u32,
    pub bytes_per_sample: u32,
    pub duration: Duration,
}

impl ChunkSpec {
    pub fn new(sample_rate: u32, bytes_per_sample: u32, duration: Duration) -> Self {
        Self {
            sample_rate,
            bytes_per_sample,
            duration,
        }
    }

    /// sample rate × chunk duration × bytes per sample, never below one sample.
    pub fn chunk_bytes(&self) -> usize {
        let samples = u128::from(self.sample_rate) * self.duration.as_millis() / 1000;
        let bytes = samples * u128::from(self.bytes_per_sample);
        usize::try_from(bytes)
            .unwrap_or(usize::MAX)
            .max(self.bytes_per_sample.max(1) as usize)
    }
}

/// Growable byte buffer that yields fixed-size chunks from its front.
///
/// Not bounded: if the consumer stalls, bytes keep accumulating.
#[derive(Debug)]
pub struct PendingAudio {
    buf: Vec<u8>,
    chunk_bytes: usize,
}

impl PendingAudio {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(chunk_bytes * 2),
            chunk_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when at least one full chunk is buffered.
    pub fn has_chunk(&self) -> bool {
        self.buf.len() >= self.chunk_bytes
    }

    /// Remove and return exactly one chunk, if available.
    pub fn take_chunk(&mut self) -> Option<Vec<u8>> {
        if !self.has_chunk() {
            return None;
        }
        Some(self.buf.drain(..self.chunk_bytes).collect())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

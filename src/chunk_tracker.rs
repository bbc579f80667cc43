//! Per-turn audio stream bookkeeping: expected sequence numbers and the
//! ephemeral turn metrics that are logged when the stream ends.

use std::time::{Duration, Instant};

/// A hole in the chunk sequence. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u32,
    pub received: u32,
}

#[derive(Debug)]
pub struct ChunkTracker {
    turn: u64,
    expected_seq: u32,
    begun_at: Instant,
    first_chunk_at: Option<Instant>,
    chunks: usize,
    bytes: usize,
    last_seq: Option<u32>,
    gaps: usize,
}

impl ChunkTracker {
    pub fn new(turn: u64) -> Self {
        Self {
            turn,
            expected_seq: 0,
            begun_at: Instant::now(),
            first_chunk_at: None,
            chunks: 0,
            bytes: 0,
            last_seq: None,
            gaps: 0,
        }
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn last_seq(&self) -> Option<u32> {
        self.last_seq
    }

    /// Account for one chunk. A mismatching sequence number resyncs the
    /// counter to `received + 1` and is reported back to the caller.
    pub fn record(&mut self, seq: Option<u32>, len: usize) -> Option<SequenceGap> {
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(Instant::now());
        }
        self.chunks += 1;
        self.bytes += len;

        let Some(seq) = seq else {
            self.expected_seq = self.expected_seq.wrapping_add(1);
            return None;
        };

        let gap = (seq != self.expected_seq).then(|| SequenceGap {
            expected: self.expected_seq,
            received: seq,
        });
        if gap.is_some() {
            self.gaps += 1;
        }
        self.last_seq = Some(seq);
        self.expected_seq = seq.wrapping_add(1);
        gap
    }

    pub fn time_to_first_chunk(&self) -> Option<Duration> {
        self.first_chunk_at.map(|t| t.duration_since(self.begun_at))
    }

    /// One-line summary for the log when the stream is finalized.
    pub fn summary(&self) -> String {
        let first = self
            .time_to_first_chunk()
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "turn {} audio: {} chunks, {} bytes, first chunk after {}, {} gaps, last seq {:?}, {}ms total",
            self.turn,
            self.chunks,
            self.bytes,
            first,
            self.gaps,
            self.last_seq,
            self.begun_at.elapsed().as_millis()
        )
    }
}

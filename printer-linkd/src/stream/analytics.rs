use std::time::{Duration, Instant};
use serde::Serialize;

/// Timings and counters attached to each delivered frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameAnalytics {
    /// Frames delivered in this session, this one included
    pub frame_index: u64,
    pub read_time: Duration,
    pub search_time: Duration,
    pub decode_time: Duration,
    /// Parts dropped since the previous delivered frame
    pub dropped_before: usize,
    pub sample_size: u32,
    pub reused_buffer: bool,
    /// Bytes left in the accumulator after this frame was cut
    pub buffered_bytes: usize,
}

/// Rolling averages over a fixed window of frames
pub struct FrameStats {
    window: usize,
    count: usize,
    started: Instant,
    read: Duration,
    search: Duration,
    decode: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub fps: f64,
    pub avg_read: Duration,
    pub avg_search: Duration,
    pub avg_decode: Duration,
}

impl FrameStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            count: 0,
            started: Instant::now(),
            read: Duration::ZERO,
            search: Duration::ZERO,
            decode: Duration::ZERO,
        }
    }

    /// Record a frame. Returns a summary once per full window.
    pub fn record(&mut self, frame: &FrameAnalytics) -> Option<WindowSummary> {
        self.record_at(frame, Instant::now())
    }

    fn record_at(&mut self, frame: &FrameAnalytics, now: Instant) -> Option<WindowSummary> {
        self.count += 1;
        self.read += frame.read_time;
        self.search += frame.search_time;
        self.decode += frame.decode_time;

        if self.count < self.window {
            return None;
        }

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let n = self.count as u32;
        let summary = WindowSummary {
            fps: if elapsed > 0.0 { self.count as f64 / elapsed } else { 0.0 },
            avg_read: self.read / n,
            avg_search: self.search / n,
            avg_decode: self.decode / n,
        };

        *self = Self {
            started: now,
            ..Self::new(self.window)
        };
        Some(summary)
    }
}

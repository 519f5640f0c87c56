// Synthesis counters kept by the service

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters updated on every synthesis, cache lookup and stream.
#[derive(Debug, Default)]
pub struct TtsStats {
    synthesis_count: AtomicU64,
    total_synthesis_us: AtomicU64,
    // RTF summed in millionths
    total_rtf_micros: AtomicU64,
    rtf_samples: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    streams: AtomicU64,
    chunks_streamed: AtomicU64,
    total_ttfb_us: AtomicU64,
    ttfb_samples: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtsStatsSnapshot {
    pub synthesis_count: u64,
    pub avg_synthesis_time_ms: f64,
    pub avg_rtf: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub streams: u64,
    pub chunks_streamed: u64,
    pub avg_ttfb_ms: f64,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn mean(total: u64, count: u64, scale: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total as f64 / count as f64 / scale
}

impl TtsStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One engine call taking `elapsed` for `audio_secs` of output.
    pub fn record_synthesis(&self, elapsed: Duration, audio_secs: f64) {
        self.synthesis_count.fetch_add(1, Ordering::Relaxed);
        self.total_synthesis_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        if audio_secs > 0.0 {
            let rtf = elapsed.as_secs_f64() / audio_secs;
            self.total_rtf_micros
                .fetch_add((rtf * 1_000_000.0) as u64, Ordering::Relaxed);
            self.rtf_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stream(&self) {
        self.streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_streamed.fetch_add(1, Ordering::Relaxed);
    }

    /// Time from stream start to its first audio frame.
    pub fn record_ttfb(&self, ttfb: Duration) {
        self.total_ttfb_us.fetch_add(micros(ttfb), Ordering::Relaxed);
        self.ttfb_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> TtsStatsSnapshot {
        let count = self.synthesis_count.load(Ordering::Relaxed);
        TtsStatsSnapshot {
            synthesis_count: count,
            avg_synthesis_time_ms: mean(self.total_synthesis_us.load(Ordering::Relaxed), count, 1_000.0),
            avg_rtf: mean(
                self.total_rtf_micros.load(Ordering::Relaxed),
                self.rtf_samples.load(Ordering::Relaxed),
                1_000_000.0,
            ),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            streams: self.streams.load(Ordering::Relaxed),
            chunks_streamed: self.chunks_streamed.load(Ordering::Relaxed),
            avg_ttfb_ms: mean(
                self.total_ttfb_us.load(Ordering::Relaxed),
                self.ttfb_samples.load(Ordering::Relaxed),
                1_000.0,
            ),
        }
    }
}

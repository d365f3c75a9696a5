use crate::transport::TransportSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Lock-free monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AggregateState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// Running numeric summary, reset when read.
#[derive(Debug, Default)]
pub struct Aggregate {
    inner: Mutex<AggregateState>,
}

impl Aggregate {
    pub fn observe(&self, sample: f64) {
        let mut state = self.state();
        if state.count == 0 {
            state.min = sample;
            state.max = sample;
        } else {
            state.min = state.min.min(sample);
            state.max = state.max.max(sample);
        }
        state.count += 1;
        state.sum += sample;
    }

    /// Writes `{prefix}_count/_sum/_min/_max/_avg` into `out` and resets.
    pub fn flush_into(&self, prefix: &str, out: &mut BTreeMap<String, f64>) {
        let state = {
            let mut state = self.state();
            std::mem::take(&mut *state)
        };
        let avg = if state.count > 0 {
            state.sum / state.count as f64
        } else {
            0.0
        };
        out.insert(format!("{prefix}_count"), state.count as f64);
        out.insert(format!("{prefix}_sum"), state.sum);
        out.insert(format!("{prefix}_min"), state.min);
        out.insert(format!("{prefix}_max"), state.max);
        out.insert(format!("{prefix}_avg"), avg);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AggregateState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// All counters and aggregates a client maintains.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub error_count: Counter,
    pub retry_count: Counter,
    pub queued_messages: Counter,
    pub sent_messages: Counter,
    pub queued_bytes: Counter,
    pub sent_bytes: Counter,
    pub transferred_bytes: Counter,
    pub request_duration: Aggregate,
    pub batch_size: Aggregate,
    pub batch_size_bytes: Aggregate,
    pub batch_size_compressed: Aggregate,
}

impl ClientStats {
    /// Snapshots the counters, drains the aggregates, and attaches queue and
    /// transport state.
    pub fn report(
        &self,
        queue_depth: usize,
        queue_size_bytes: usize,
        transport: TransportSnapshot,
    ) -> StatsReport {
        let mut aggregates = BTreeMap::new();
        self.request_duration
            .flush_into("request_duration", &mut aggregates);
        self.batch_size.flush_into("batch_size", &mut aggregates);
        self.batch_size_bytes
            .flush_into("batch_size_bytes", &mut aggregates);
        self.batch_size_compressed
            .flush_into("batch_size_compressed", &mut aggregates);
        StatsReport {
            error_count: self.error_count.get(),
            retry_count: self.retry_count.get(),
            queued_messages: self.queued_messages.get(),
            sent_messages: self.sent_messages.get(),
            queued_bytes: self.queued_bytes.get(),
            sent_bytes: self.sent_bytes.get(),
            transferred_bytes: self.transferred_bytes.get(),
            queue_depth,
            queue_size_bytes,
            aggregates,
            transport,
        }
    }
}

/// Point-in-time view of a client's counters and drained aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub error_count: u64,
    pub retry_count: u64,
    pub queued_messages: u64,
    pub sent_messages: u64,
    pub queued_bytes: u64,
    pub sent_bytes: u64,
    pub transferred_bytes: u64,
    pub queue_depth: usize,
    pub queue_size_bytes: usize,
    pub aggregates: BTreeMap<String, f64>,
    pub transport: TransportSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let counter = Counter::default();
        counter.inc();
        counter.add(41);
        assert_eq!(counter.get(), 42);
    }

    #[test]
    fn aggregate_tracks_and_resets() {
        let aggregate = Aggregate::default();
        aggregate.observe(3.0);
        aggregate.observe(1.0);
        aggregate.observe(8.0);

        let mut out = BTreeMap::new();
        aggregate.flush_into("batch_size", &mut out);
        assert_eq!(out["batch_size_count"], 3.0);
        assert_eq!(out["batch_size_sum"], 12.0);
        assert_eq!(out["batch_size_min"], 1.0);
        assert_eq!(out["batch_size_max"], 8.0);
        assert_eq!(out["batch_size_avg"], 4.0);

        // Drained on read.
        let mut again = BTreeMap::new();
        aggregate.flush_into("batch_size", &mut again);
        assert_eq!(again["batch_size_count"], 0.0);
        assert_eq!(again["batch_size_sum"], 0.0);
    }

    #[test]
    fn single_sample_is_both_min_and_max() {
        let aggregate = Aggregate::default();
        aggregate.observe(-2.5);
        let mut out = BTreeMap::new();
        aggregate.flush_into("d", &mut out);
        assert_eq!(out["d_min"], -2.5);
        assert_eq!(out["d_max"], -2.5);
        assert_eq!(out["d_avg"], -2.5);
    }
}

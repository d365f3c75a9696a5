use crate::cancel::{first_of, or_cancelled, CancelGroup, Cancellable, Cancelled};
use crate::compress::{gzip, CompressionError};
use crate::config::{ConfigError, ConfigOverrides, HecConfig};
use crate::retry::backoff::WaitStrategy;
use crate::retry::{retry, RetryError, RetryOptions};
use crate::serialize::{
    Event, HecSerializer, Metric, MetricGroup, Record, SerializationError, SerializedMessage,
};
use crate::stats::{ClientStats, StatsReport};
use crate::transport::{Transport, TransportError};
use bytes::BytesMut;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client has been shut down")]
    Shutdown,
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] SerializationError),
}

/// How one in-flight batch ended. Cloneable so every waiter on the flush's
/// completion signal sees the same outcome.
#[derive(Debug, Clone, Error)]
pub enum FlushError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("{0}")]
    Send(Arc<RetryError<TransportError>>),
    #[error("{0}")]
    Compression(Arc<CompressionError>),
}

impl FlushError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlushError::Cancelled(_))
    }
}

/// What `shutdown` managed to get out the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub drained: bool,
    pub cancelled_flushes: usize,
}

type FlushOutcome = Result<(), FlushError>;
type FlushWatch = watch::Receiver<Option<FlushOutcome>>;

#[derive(Default)]
struct QueueState {
    queue: Vec<SerializedMessage>,
    queue_bytes: usize,
    idle_timer: Option<JoinHandle<()>>,
    active_flushes: HashMap<Uuid, FlushWatch>,
}

struct ClientInner {
    config: HecConfig,
    url: Url,
    health_url: Url,
    base_headers: HeaderMap,
    transport: Arc<Transport>,
    serializer: HecSerializer,
    stats: ClientStats,
    active: AtomicBool,
    flushes: CancelGroup,
    state: Mutex<QueueState>,
}

/// Batching client for the Splunk HTTP Event Collector.
///
/// Producers push individual records; the client serializes them immediately,
/// accumulates the bytes in an in-memory queue, and sends coarse-grained
/// batches when the queue crosses its byte or entry threshold or has sat idle
/// for the configured delay. Multiple flushes may be in flight at once, each
/// retrying independently and each cancellable through `shutdown`.
///
/// `Clone` is shallow: clones share the queue, stats, and connection pool.
/// Use [`HecClient::clone_with`] to derive a client with adjusted
/// configuration. All methods assume a running tokio runtime.
#[derive(Clone)]
pub struct HecClient {
    inner: Arc<ClientInner>,
}

enum DrainOutcome {
    Drained,
    DeadlineElapsed,
}

impl HecClient {
    pub fn new(config: HecConfig) -> Result<Self, ConfigError> {
        let url = config.validate()?;
        let transport =
            Transport::shared(&url, &config.pool_policy()).map_err(ConfigError::Transport)?;
        Self::build(config, url, transport)
    }

    fn with_transport(config: HecConfig, transport: Arc<Transport>) -> Result<Self, ConfigError> {
        let url = config.validate()?;
        Self::build(config, url, transport)
    }

    fn build(config: HecConfig, url: Url, transport: Arc<Transport>) -> Result<Self, ConfigError> {
        let mut health_url = url.clone();
        health_url.set_path("/services/collector/health");

        let mut base_headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Splunk {token}"))
                .map_err(|_| ConfigError::InvalidToken)?;
            base_headers.insert(AUTHORIZATION, value);
        }

        let serializer = HecSerializer::new(
            config.default_metadata.clone(),
            config.default_fields.clone(),
            config.multiple_metric_format,
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                url,
                health_url,
                base_headers,
                transport,
                serializer,
                stats: ClientStats::default(),
                active: AtomicBool::new(true),
                flushes: CancelGroup::new(),
                state: Mutex::new(QueueState::default()),
            }),
        })
    }

    /// Derives a client from this one.
    ///
    /// Empty overrides return this very instance. A changed URL produces a
    /// wholly new client with its own connection pool; any other change
    /// produces a client with the merged configuration that shares this
    /// client's pool.
    pub fn clone_with(&self, overrides: ConfigOverrides) -> Result<HecClient, ConfigError> {
        let overrides = overrides.normalized();
        if overrides.is_empty() {
            return Ok(self.clone());
        }
        let mut config = self.inner.config.clone();
        overrides.apply(&mut config);
        if config.url != self.inner.config.url {
            return HecClient::new(config);
        }
        Self::with_transport(config, Arc::clone(&self.inner.transport))
    }

    pub fn config(&self) -> &HecConfig {
        &self.inner.config
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_same_instance(&self, other: &HecClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn shares_transport_with(&self, other: &HecClient) -> bool {
        Arc::ptr_eq(&self.inner.transport, &other.inner.transport)
    }

    /// Number of flushes currently in flight.
    pub fn in_flight_flushes(&self) -> usize {
        self.state().active_flushes.len()
    }

    /// Enqueues a record, dispatching on its shape.
    pub fn push(&self, record: impl Into<Record>) -> Result<(), ClientError> {
        match record.into() {
            Record::Event(event) => self.push_event(event),
            Record::Metric(metric) => self.push_metric(metric),
        }
    }

    pub fn push_event(&self, event: Event) -> Result<(), ClientError> {
        self.ensure_active()?;
        let message = self.inner.serializer.serialize_event(&event)?;
        self.push_serialized(message)
    }

    pub fn push_metric(&self, metric: Metric) -> Result<(), ClientError> {
        self.ensure_active()?;
        let message = self.inner.serializer.serialize_metric(&metric)?;
        self.push_serialized(message)
    }

    pub fn push_metrics(&self, group: MetricGroup) -> Result<(), ClientError> {
        self.ensure_active()?;
        let messages = self.inner.serializer.serialize_metric_group(&group)?;
        for message in messages {
            self.push_serialized(message)?;
        }
        Ok(())
    }

    /// Completes when every currently in-flight flush and the outstanding
    /// queue content have finished sending. Does not block new pushes.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let mut waits: Vec<FlushWatch> = {
            let state = self.state();
            state.active_flushes.values().cloned().collect()
        };
        if let Some(receiver) = self.flush_now() {
            waits.push(receiver);
        }
        let mut first_error = None;
        for mut receiver in waits {
            let outcome = await_outcome(&mut receiver).await;
            if let Some(Err(flush_error)) = outcome {
                first_error.get_or_insert(flush_error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(flush_error) => Err(flush_error),
        }
    }

    /// One-shot health probe: succeeds iff the collector's health endpoint
    /// answers 2xx.
    pub async fn check_available(&self) -> Result<(), TransportError> {
        self.inner
            .transport
            .get(self.inner.health_url.clone(), None)
            .await
            .map(|_| ())
    }

    /// Polls the health endpoint with linear backoff until it answers or the
    /// deadline passes.
    pub async fn wait_until_available(
        &self,
        max_time: Duration,
    ) -> Result<(), RetryError<TransportError>> {
        let attempts = AtomicU64::new(0);
        let result = retry(
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.check_available()
            },
            RetryOptions {
                timeout: Some(max_time),
                wait: WaitStrategy::Linear {
                    min: Duration::from_millis(500),
                    step: Duration::from_millis(250),
                    max: Duration::from_millis(2500),
                },
                on_error: Some(Box::new(|probe_error: &TransportError, attempt| {
                    if attempt == 1 {
                        warn!(error = %probe_error, "HEC endpoint not available yet, waiting");
                    }
                })),
                task_name: "wait for HEC",
                ..RetryOptions::default()
            },
        )
        .await;
        if result.is_ok() {
            info!(
                attempts = attempts.load(Ordering::Relaxed),
                "HEC endpoint is available"
            );
        }
        result
    }

    /// Stops accepting records, then tries to drain outstanding work within
    /// `max_time` (if given) before cancelling whatever is still in flight.
    pub async fn shutdown(&self, max_time: Option<Duration>) -> ShutdownSummary {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return ShutdownSummary {
                drained: true,
                cancelled_flushes: 0,
            };
        }
        info!("shutting down HEC client");

        let outstanding = {
            let state = self.state();
            !state.active_flushes.is_empty() || !state.queue.is_empty()
        };
        let mut drained = !outstanding;
        if outstanding {
            if let Some(limit) = max_time {
                let drain = {
                    let client = self.clone();
                    Cancellable::wrap(move |token| async move {
                        match or_cancelled(&token, client.flush()).await {
                            Ok(_) => DrainOutcome::Drained,
                            Err(Cancelled) => DrainOutcome::DeadlineElapsed,
                        }
                    })
                };
                let deadline = Cancellable::wrap(move |token| async move {
                    let _ = or_cancelled(&token, sleep(limit)).await;
                    DrainOutcome::DeadlineElapsed
                });
                drained = matches!(
                    first_of(vec![drain, deadline]).await,
                    Some(DrainOutcome::Drained)
                );
            }
        }

        if let Some(timer) = self.state().idle_timer.take() {
            timer.abort();
        }
        self.inner.flushes.cancel_all();

        let remaining: Vec<FlushWatch> = {
            let state = self.state();
            state.active_flushes.values().cloned().collect()
        };
        let mut cancelled_flushes = 0;
        for mut receiver in remaining {
            if let Some(Err(flush_error)) = await_outcome(&mut receiver).await {
                if flush_error.is_cancelled() {
                    cancelled_flushes += 1;
                }
            }
        }

        if drained && cancelled_flushes == 0 {
            info!("HEC client drained cleanly");
        } else {
            warn!(cancelled_flushes, "HEC client shut down with work outstanding");
        }
        ShutdownSummary {
            drained: drained && cancelled_flushes == 0,
            cancelled_flushes,
        }
    }

    /// Snapshots the counters, drains the running aggregates, and reports
    /// queue depth and connection-pool state. Never fails.
    pub fn flush_stats(&self) -> StatsReport {
        let (queue_depth, queue_size_bytes) = {
            let state = self.state();
            (state.queue.len(), state.queue_bytes)
        };
        self.inner
            .stats
            .report(queue_depth, queue_size_bytes, self.inner.transport.snapshot())
    }

    fn ensure_active(&self) -> Result<(), ClientError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ClientError::Shutdown)
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push_serialized(&self, message: SerializedMessage) -> Result<(), ClientError> {
        self.ensure_active()?;
        self.inner.stats.queued_messages.inc();
        self.inner.stats.queued_bytes.add(message.len() as u64);

        let (before_append, after_append) = {
            let mut state = self.state();
            // Crossing the byte threshold sends the current batch without the
            // newcomer, so a batch exceeds the limit by at most one message.
            let before = if state.queue_bytes + message.len() > self.inner.config.max_queue_size {
                self.take_batch_locked(&mut state)
            } else {
                None
            };
            state.queue_bytes += message.len();
            state.queue.push(message);
            let after = self.schedule_flush_locked(&mut state);
            (before, after)
        };
        if let Some(batch) = before_append {
            self.dispatch(batch);
        }
        if let Some(batch) = after_append {
            self.dispatch(batch);
        }
        Ok(())
    }

    /// Entry-threshold check, otherwise arms the idle timer once.
    fn schedule_flush_locked(&self, state: &mut QueueState) -> Option<Vec<SerializedMessage>> {
        let cap = self.inner.config.max_queue_entries;
        if cap > 0 && state.queue.len() as i64 > cap {
            return self.take_batch_locked(state);
        }
        if state.idle_timer.is_none() {
            let client = self.clone();
            let delay = self.inner.config.flush_time;
            state.idle_timer = Some(tokio::spawn(async move {
                sleep(delay).await;
                let _ = client.flush_now();
            }));
        }
        None
    }

    /// Disarms the idle timer and atomically swaps the queue out.
    fn take_batch_locked(&self, state: &mut QueueState) -> Option<Vec<SerializedMessage>> {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        if state.queue.is_empty() {
            return None;
        }
        state.queue_bytes = 0;
        Some(std::mem::take(&mut state.queue))
    }

    fn flush_now(&self) -> Option<FlushWatch> {
        let batch = {
            let mut state = self.state();
            self.take_batch_locked(&mut state)
        }?;
        Some(self.dispatch(batch))
    }

    /// Registers a flush handle for the batch and starts the send.
    fn dispatch(&self, batch: Vec<SerializedMessage>) -> FlushWatch {
        let id = Uuid::new_v4();
        let (done_tx, done_rx) = watch::channel(None);
        self.state().active_flushes.insert(id, done_rx.clone());

        let client = self.clone();
        tokio::spawn(async move {
            let outcome = match client
                .inner
                .flushes
                .scoped(|token| client.send_batch(id, &batch, token))
                .await
            {
                Ok(result) => result,
                Err(cancelled) => Err(FlushError::Cancelled(cancelled)),
            };
            if matches!(&outcome, Err(e) if e.is_cancelled()) {
                warn!(flush = %id, "flush cancelled, batch dropped");
            }
            // The handle leaves the active set before its completion fires.
            client.state().active_flushes.remove(&id);
            let _ = done_tx.send(Some(outcome));
        });
        done_rx
    }

    async fn send_batch(
        &self,
        id: Uuid,
        batch: &[SerializedMessage],
        cancel: CancellationToken,
    ) -> Result<(), FlushError> {
        let stats = &self.inner.stats;
        let count = batch.len() as u64;
        let raw_len: usize = batch.iter().map(SerializedMessage::len).sum();
        let mut raw = BytesMut::with_capacity(raw_len);
        for message in batch {
            raw.extend_from_slice(message.as_bytes());
        }
        let raw = raw.freeze();

        stats.batch_size.observe(count as f64);
        stats.batch_size_bytes.observe(raw.len() as f64);

        let body = if self.inner.config.gzip {
            let compressed = gzip(&raw).map_err(|gzip_error| {
                error!(flush = %id, error = %gzip_error, "failed to compress batch");
                FlushError::Compression(Arc::new(gzip_error))
            })?;
            stats.batch_size_compressed.observe(compressed.len() as f64);
            compressed
        } else {
            raw.clone()
        };

        let mut headers = self.inner.base_headers.clone();
        if self.inner.config.gzip {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

        debug!(
            flush = %id,
            messages = count,
            raw_bytes = raw.len(),
            wire_bytes = body.len(),
            "sending batch"
        );

        let outcome = retry(
            || {
                // The transport consumes the body, so each attempt gets its
                // own view of the same bytes.
                let attempt_body = body.clone();
                let attempt_headers = headers.clone();
                let url = self.inner.url.clone();
                let cancel = cancel.clone();
                async move {
                    let started = Instant::now();
                    let result = self
                        .inner
                        .transport
                        .post(url, attempt_headers, attempt_body, Some(&cancel))
                        .await;
                    self.inner
                        .stats
                        .request_duration
                        .observe(started.elapsed().as_secs_f64() * 1000.0);
                    if result.is_err() {
                        self.inner.stats.error_count.inc();
                    }
                    result.map(|_| ())
                }
            },
            RetryOptions {
                max_retries: Some(self.inner.config.max_retries),
                wait: self.inner.config.retry_wait_time,
                on_error: Some(Box::new(|send_error: &TransportError, attempt| {
                    stats.retry_count.inc();
                    if attempt == 1 {
                        warn!(flush = %id, error = %send_error, "sending batch failed, retrying");
                    } else {
                        debug!(flush = %id, attempt, error = %send_error, "sending batch failed again");
                    }
                })),
                task_name: "hec send",
                cancel: Some(cancel.clone()),
                ..RetryOptions::default()
            },
        )
        .await;

        match outcome {
            Ok(()) => {
                stats.sent_messages.add(count);
                stats.sent_bytes.add(raw.len() as u64);
                stats.transferred_bytes.add(body.len() as u64);
                debug!(flush = %id, messages = count, "batch sent");
                Ok(())
            }
            Err(RetryError::Cancelled(cancelled)) => Err(FlushError::Cancelled(cancelled)),
            Err(exhausted) => {
                error!(flush = %id, error = %exhausted, "giving up on batch");
                Err(FlushError::Send(Arc::new(exhausted)))
            }
        }
    }
}

/// Waits for a flush's completion signal; `None` only if the sender vanished
/// without reporting, which does not happen on any normal path.
async fn await_outcome(receiver: &mut FlushWatch) -> Option<FlushOutcome> {
    loop {
        if receiver.borrow_and_update().is_some() {
            break;
        }
        if receiver.changed().await.is_err() {
            break;
        }
    }
    receiver.borrow().clone()
}

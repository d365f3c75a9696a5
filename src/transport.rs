use crate::cancel::{or_cancelled, Cancelled};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

// How long an idle keep-alive socket is retained in the pool.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HEC responded with status {0}")]
    Status(u16),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Connection-pool policy resolved from the client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolPolicy {
    pub request_keep_alive: bool,
    pub max_sockets: usize,
    pub timeout: Duration,
    pub validate_certificate: bool,
    pub user_agent: String,
}

/// A pooled HTTP transport shared by every request a client issues.
///
/// The per-host socket cap is enforced with a semaphore, so callers that
/// outrun the pool wait on socket acquisition instead of opening new
/// connections without bound.
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    sockets: Semaphore,
    stats: TransportStats,
    policy: PoolPolicy,
}

impl Transport {
    pub fn new(policy: PoolPolicy) -> Result<Self, TransportError> {
        let idle_per_host = if policy.request_keep_alive {
            policy.max_sockets
        } else {
            0
        };
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .pool_max_idle_per_host(idle_per_host)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(&policy.user_agent)
            .danger_accept_invalid_certs(!policy.validate_certificate)
            .build()
            .map_err(TransportError::Build)?;
        Ok(Self {
            client,
            sockets: Semaphore::new(policy.max_sockets.max(1)),
            stats: TransportStats::default(),
            policy,
        })
    }

    /// Looks the endpoint's origin up in the process-wide pool registry and
    /// reuses an existing transport with an identical policy, so independent
    /// clients pointed at the same collector share one connection pool.
    pub fn shared(endpoint: &Url, policy: &PoolPolicy) -> Result<Arc<Self>, TransportError> {
        static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<Transport>>>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(Default::default);
        let key = origin_key(endpoint);
        let mut pools = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pools.get(&key).and_then(Weak::upgrade) {
            if existing.policy == *policy {
                return Ok(existing);
            }
        }
        let transport = Arc::new(Transport::new(policy.clone())?);
        pools.insert(key, Arc::downgrade(&transport));
        Ok(transport)
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// POSTs a body, honouring the cancellation token mid-request.
    /// Any non-2xx response is an error so the caller's retry policy applies.
    pub async fn post(
        &self,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<u16, TransportError> {
        let _socket = self.acquire_socket(cancel).await?;
        let request = self.client.post(url).headers(headers).body(body);
        self.execute(request, cancel).await
    }

    /// GETs a URL with the same pool, timeout, and status semantics as `post`.
    pub async fn get(
        &self,
        url: Url,
        cancel: Option<&CancellationToken>,
    ) -> Result<u16, TransportError> {
        let _socket = self.acquire_socket(cancel).await?;
        let request = self.client.get(url);
        self.execute(request, cancel).await
    }

    async fn acquire_socket(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, TransportError> {
        let acquire = self.sockets.acquire();
        let permit = match cancel {
            Some(token) => or_cancelled(token, acquire).await?,
            None => acquire.await,
        };
        // The semaphore lives as long as the transport and is never closed.
        Ok(permit.expect("socket semaphore closed"))
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<u16, TransportError> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlightGuard(&self.stats);

        let send = async {
            let response = request.send().await?;
            Ok::<_, reqwest::Error>(response.status())
        };
        let status = match cancel {
            Some(token) => match or_cancelled(token, send).await {
                Ok(sent) => sent?,
                Err(cancelled) => return Err(TransportError::Cancelled(cancelled)),
            },
            None => send.await?,
        };

        if status.is_success() {
            self.stats.successful_requests.fetch_add(1, Ordering::Relaxed);
            Ok(status.as_u16())
        } else {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            Err(TransportError::Status(status.as_u16()))
        }
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            max_sockets: self.policy.max_sockets,
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            successful_requests: self.stats.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
        }
    }
}

fn origin_key(url: &Url) -> String {
    let port = url
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        port
    )
}

#[derive(Debug, Default)]
struct TransportStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    in_flight: AtomicU64,
}

struct InFlightGuard<'a>(&'a TransportStats);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Immutable view of the transport counters, reported by `flush_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportSnapshot {
    pub max_sockets: usize,
    pub in_flight: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

use crate::retry::backoff::WaitStrategy;
use crate::serialize::{deep_merge, Fields, Metadata};
use crate::transport::{PoolPolicy, TransportError};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid HEC url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("HEC url is missing a host")]
    MissingHost,
    #[error("max_queue_size must be greater than zero")]
    ZeroQueueSize,
    #[error("token contains characters not permitted in an HTTP header")]
    InvalidToken,
    #[error("failed to set up HTTP transport: {0}")]
    Transport(#[source] TransportError),
}

/// Resolved client configuration. All defaults are applied at construction;
/// see [`ConfigOverrides`] for cloning a client with adjustments.
#[derive(Debug, Clone, PartialEq)]
pub struct HecConfig {
    /// Ingest endpoint.
    pub url: String,
    /// Bearer token sent as `Authorization: Splunk <token>`; omitted if unset.
    pub token: Option<String>,
    pub user_agent: String,
    /// TLS peer verification for HTTPS endpoints.
    pub validate_certificate: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Per-host socket cap; bounds concurrent flushes to one endpoint.
    pub max_sockets: usize,
    pub request_keep_alive: bool,
    /// Gzip the request body.
    pub gzip: bool,
    /// Emit a single multi-measurement envelope instead of one per metric.
    pub multiple_metric_format: bool,
    /// Byte threshold above which the queue is flushed eagerly.
    pub max_queue_size: usize,
    /// Entry threshold for eager flushes; `-1` disables it.
    pub max_queue_entries: i64,
    /// Idle delay before a partially-full queue is flushed.
    pub flush_time: Duration,
    /// Retry cap per batch.
    pub max_retries: u32,
    pub retry_wait_time: WaitStrategy,
    /// Applied wherever a record omits a metadata field.
    pub default_metadata: Metadata,
    /// Deep-merged under each record's fields.
    pub default_fields: Fields,
}

impl Default for HecConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:8088/services/collector/event".to_owned(),
            token: None,
            user_agent: concat!("hec-client/", env!("CARGO_PKG_VERSION")).to_owned(),
            validate_certificate: true,
            timeout: Duration::from_secs(30),
            max_sockets: 128,
            request_keep_alive: true,
            gzip: false,
            multiple_metric_format: false,
            max_queue_size: 512 * 1024,
            max_queue_entries: -1,
            flush_time: Duration::ZERO,
            max_retries: 10,
            retry_wait_time: WaitStrategy::Exponential {
                min: Duration::from_millis(100),
                factor: 2.0,
                max: Duration::from_secs(30),
            },
            default_metadata: Metadata::default(),
            default_fields: Fields::new(),
        }
    }
}

impl HecConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parses and checks the endpoint, returning the validated URL.
    pub(crate) fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
        if url.host_str().is_none() {
            return Err(ConfigError::MissingHost);
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        Ok(url)
    }

    pub(crate) fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            request_keep_alive: self.request_keep_alive,
            max_sockets: self.max_sockets,
            timeout: self.timeout,
            validate_certificate: self.validate_certificate,
            user_agent: self.user_agent.clone(),
        }
    }
}

/// All-optional mirror of [`HecConfig`] used when cloning a client.
///
/// Empty values (unset options, empty strings, empty maps) are dropped before
/// the merge, so an overrides value that carries nothing leaves the original
/// client untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub url: Option<String>,
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub validate_certificate: Option<bool>,
    pub timeout: Option<Duration>,
    pub max_sockets: Option<usize>,
    pub request_keep_alive: Option<bool>,
    pub gzip: Option<bool>,
    pub multiple_metric_format: Option<bool>,
    pub max_queue_size: Option<usize>,
    pub max_queue_entries: Option<i64>,
    pub flush_time: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_wait_time: Option<WaitStrategy>,
    pub default_metadata: Option<Metadata>,
    pub default_fields: Option<Fields>,
}

impl ConfigOverrides {
    /// Drops empty strings, empty maps, and all-empty metadata.
    pub fn normalized(mut self) -> Self {
        fn keep_string(value: Option<String>) -> Option<String> {
            value.filter(|s| !s.is_empty())
        }
        self.url = keep_string(self.url);
        self.token = keep_string(self.token);
        self.user_agent = keep_string(self.user_agent);
        self.default_metadata = self.default_metadata.filter(|m| !m.is_empty());
        self.default_fields = self.default_fields.filter(|f| !f.is_empty());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Deep-merges these overrides into a configuration: scalar fields are
    /// replaced, metadata merges per field, default fields merge recursively.
    pub fn apply(&self, config: &mut HecConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(validate) = self.validate_certificate {
            config.validate_certificate = validate;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(max_sockets) = self.max_sockets {
            config.max_sockets = max_sockets;
        }
        if let Some(keep_alive) = self.request_keep_alive {
            config.request_keep_alive = keep_alive;
        }
        if let Some(gzip) = self.gzip {
            config.gzip = gzip;
        }
        if let Some(multi) = self.multiple_metric_format {
            config.multiple_metric_format = multi;
        }
        if let Some(size) = self.max_queue_size {
            config.max_queue_size = size;
        }
        if let Some(entries) = self.max_queue_entries {
            config.max_queue_entries = entries;
        }
        if let Some(flush_time) = self.flush_time {
            config.flush_time = flush_time;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(wait) = self.retry_wait_time {
            config.retry_wait_time = wait;
        }
        if let Some(metadata) = &self.default_metadata {
            config.default_metadata = metadata.resolved_over(&config.default_metadata);
        }
        if let Some(fields) = &self.default_fields {
            deep_merge(&mut config.default_fields, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_bad_urls() {
        let mut config = HecConfig::new("not a url");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));

        config.url = "ftp://collector:8088".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme(_))
        ));

        config.url = "https://collector:8088/services/collector/event".to_owned();
        config.max_queue_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroQueueSize)));
    }

    #[test]
    fn normalized_drops_empty_values() {
        let overrides = ConfigOverrides {
            url: Some(String::new()),
            token: Some(String::new()),
            default_metadata: Some(Metadata::default()),
            default_fields: Some(Fields::new()),
            ..ConfigOverrides::default()
        }
        .normalized();
        assert!(overrides.is_empty());
    }

    #[test]
    fn apply_merges_metadata_per_field_and_fields_deeply() {
        let mut config = HecConfig::default();
        config.default_metadata.host = Some("original-host".to_owned());
        config.default_metadata.index = Some("main".to_owned());
        config.default_fields = match json!({"env": "prod", "nested": {"a": 1}}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };

        let overrides = ConfigOverrides {
            token: Some("secret".to_owned()),
            default_metadata: Some(Metadata {
                host: Some("override-host".to_owned()),
                ..Metadata::default()
            }),
            default_fields: Some(match json!({"nested": {"b": 2}}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            }),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.default_metadata.host.as_deref(), Some("override-host"));
        assert_eq!(config.default_metadata.index.as_deref(), Some("main"));
        assert_eq!(
            serde_json::Value::Object(config.default_fields),
            json!({"env": "prod", "nested": {"a": 1, "b": 2}})
        );
    }
}

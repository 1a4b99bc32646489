//! Client and per-request configuration.
//!
//! [`ClientConfig`] is fixed when the client is built. [`RequestOptions`]
//! overrides it for one call. Every request resolves its effective settings
//! once, at submission, with precedence *per call > client > built-in
//! default*.
//!
//! With the `config-file` feature a `ClientConfig` can be loaded from TOML:
//!
//! ```toml
//! timeout_ms = 5000
//! max_concurrent = 4
//! keep_alive = true
//!
//! [tls]
//! reject_unauthorized = false
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::tls::TlsOptions;

/// Default total timeout per request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default maximum decoded response size.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;
/// Default per-endpoint concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Default client-wide concurrency ceiling.
pub const DEFAULT_MAX_TOTAL_CONCURRENT: usize = 100;
/// Default duplex write buffer capacity.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A limit that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// The configuration file could not be read.
    #[cfg(feature = "config-file")]
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: std::path::PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration text is not valid TOML for [`ClientConfig`].
    #[cfg(feature = "config-file")]
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Client-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Total time allowed per request.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Maximum decoded body size of buffered responses.
    pub max_response_size: usize,
    /// Give each endpoint its own pooled keep-alive agent.
    pub keep_alive: bool,
    /// TLS parameters.
    pub tls: TlsOptions,
    /// Outstanding requests allowed per endpoint.
    pub max_concurrent: usize,
    /// Outstanding requests allowed across all endpoints.
    pub max_total_concurrent: usize,
    /// Decode `gzip` and `deflate` response bodies.
    pub auto_content_decoding: bool,
    /// Duplex write buffer capacity in bytes.
    pub write_buffer_size: usize,
    /// Agent used for every request instead of the client's own agents.
    #[serde(skip)]
    pub agent: Option<Agent>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            keep_alive: false,
            tls: TlsOptions::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_total_concurrent: DEFAULT_MAX_TOTAL_CONCURRENT,
            auto_content_decoding: true,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            agent: None,
        }
    }
}

impl ClientConfig {
    /// Set the request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum buffered response size.
    #[must_use]
    pub const fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    /// Enable per-endpoint keep-alive agents.
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Replace the TLS parameters.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Set the per-endpoint concurrency ceiling.
    #[must_use]
    pub const fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit;
        self
    }

    /// Set the client-wide concurrency ceiling.
    #[must_use]
    pub const fn max_total_concurrent(mut self, limit: usize) -> Self {
        self.max_total_concurrent = limit;
        self
    }

    /// Toggle automatic content decoding.
    #[must_use]
    pub const fn auto_content_decoding(mut self, enabled: bool) -> Self {
        self.auto_content_decoding = enabled;
        self
    }

    /// Set the duplex write buffer capacity.
    #[must_use]
    pub const fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Route every request through `agent`.
    #[must_use]
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Reject limits that would stall every request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_concurrent, "max_concurrent"),
            (self.max_total_concurrent, "max_total_concurrent"),
            (self.write_buffer_size, "write_buffer_size"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        Ok(())
    }

    /// Parse a configuration from TOML text and validate it.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file and validate it.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Effective settings for one request.
    pub(crate) fn resolve(&self, options: &RequestOptions) -> ResolvedOptions {
        let tls_override = !options.tls.is_empty() && self.tls.merged(&options.tls) != self.tls;
        ResolvedOptions {
            timeout: options.timeout.unwrap_or(self.timeout),
            max_response_size: options.max_response_size.unwrap_or(self.max_response_size),
            keep_alive: options.keep_alive.unwrap_or(self.keep_alive),
            tls: self.tls.merged(&options.tls),
            tls_override,
            max_concurrent: options.max_concurrent.unwrap_or(self.max_concurrent),
            auto_content_decoding: options
                .auto_content_decoding
                .unwrap_or(self.auto_content_decoding),
            write_buffer_size: options.write_buffer_size.unwrap_or(self.write_buffer_size),
            agent: options.agent.clone().or_else(|| self.agent.clone()),
            mode: options.stream_mode(),
        }
    }
}

/// Per-call overrides. Unset fields fall back to the client configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Maximum buffered response size.
    pub max_response_size: Option<usize>,
    /// Use a private keep-alive agent when this call creates the endpoint.
    pub keep_alive: Option<bool>,
    /// TLS overrides, merged field-wise over the client's.
    pub tls: TlsOptions,
    /// Per-endpoint ceiling; applies only when this call creates the endpoint.
    pub max_concurrent: Option<usize>,
    /// Content decoding toggle.
    pub auto_content_decoding: Option<bool>,
    /// Agent for this call.
    pub agent: Option<Agent>,
    /// Duplex write buffer capacity.
    pub write_buffer_size: Option<usize>,
    /// Stream both the request and the response body.
    pub stream: bool,
    /// Stream only the request body; the response is buffered.
    pub write_stream: bool,
    /// Stream only the response body; the request body is empty.
    pub read_stream: bool,
}

impl RequestOptions {
    /// Empty overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the maximum buffered response size.
    #[must_use]
    pub const fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = Some(bytes);
        self
    }

    /// Override keep-alive.
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    /// Override TLS parameters.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Override the per-endpoint ceiling for a new endpoint.
    #[must_use]
    pub const fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }

    /// Override content decoding.
    #[must_use]
    pub const fn auto_content_decoding(mut self, enabled: bool) -> Self {
        self.auto_content_decoding = Some(enabled);
        self
    }

    /// Use `agent` for this call.
    #[must_use]
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Override the duplex write buffer capacity.
    #[must_use]
    pub const fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = Some(bytes);
        self
    }

    /// Stream both directions.
    #[must_use]
    pub const fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Stream the request body only.
    #[must_use]
    pub const fn write_stream(mut self) -> Self {
        self.write_stream = true;
        self
    }

    /// Stream the response body only.
    #[must_use]
    pub const fn read_stream(mut self) -> Self {
        self.read_stream = true;
        self
    }

    /// True when any stream flag is set.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.stream || self.write_stream || self.read_stream
    }

    pub(crate) const fn stream_mode(&self) -> StreamMode {
        match (self.stream, self.write_stream, self.read_stream) {
            (false, true, false) => StreamMode::WriteOnly,
            (false, false, true) => StreamMode::ReadOnly,
            _ => StreamMode::Duplex,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.max_concurrent, "max_concurrent"),
            (self.write_buffer_size, "write_buffer_size"),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::Zero("timeout"));
        }
        Ok(())
    }
}

/// Which directions of a streaming request go through the
/// [`DuplexStream`](crate::DuplexStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    /// Request body written and response body read through the stream.
    Duplex,
    /// Request body written through the stream; response buffered.
    WriteOnly,
    /// Empty request body; response body read through the stream.
    ReadOnly,
}

impl StreamMode {
    pub(crate) const fn writes(self) -> bool {
        matches!(self, Self::Duplex | Self::WriteOnly)
    }

    pub(crate) const fn reads(self) -> bool {
        matches!(self, Self::Duplex | Self::ReadOnly)
    }
}

/// Settings of one request after precedence resolution.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub(crate) timeout: Duration,
    pub(crate) max_response_size: usize,
    pub(crate) keep_alive: bool,
    pub(crate) tls: TlsOptions,
    /// The call's TLS options differ from the client's.
    pub(crate) tls_override: bool,
    pub(crate) max_concurrent: usize,
    pub(crate) auto_content_decoding: bool,
    pub(crate) write_buffer_size: usize,
    pub(crate) agent: Option<Agent>,
    pub(crate) mode: StreamMode,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Connection-reuse handles.
//!
//! An [`Agent`] wraps a hyper-util client with an HTTPS-or-HTTP connector.
//! Agents are cheap to clone; clones share one connection pool. A pooling
//! (keep-alive) agent keeps idle connections for reuse, a non-pooling agent
//! closes every connection after its exchange.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::body::RequestBody;
use crate::tls::{self, TlsError, TlsOptions};

/// Idle time after which pooled connections are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

type Transport = Client<HttpsConnector<HttpConnector>, RequestBody>;

/// A shareable HTTP/1 transport with its own connection pool.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    id: u64,
    keep_alive: bool,
    client: Transport,
}

impl Agent {
    /// Non-pooling agent with default TLS settings.
    pub fn new() -> Result<Self, TlsError> {
        Self::builder().build()
    }

    /// Start configuring an agent.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Agent over an already-built rustls configuration.
    #[must_use]
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>, keep_alive: bool) -> Self {
        Self::assemble(config, keep_alive, DEFAULT_IDLE_TIMEOUT, None)
    }

    fn assemble(
        config: Arc<rustls::ClientConfig>,
        keep_alive: bool,
        idle_timeout: Duration,
        connect_timeout: Option<Duration>,
    ) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(connect_timeout);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*config).clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        if keep_alive {
            builder.pool_idle_timeout(idle_timeout);
        } else {
            builder.pool_max_idle_per_host(0);
        }

        Self {
            inner: Arc::new(AgentInner {
                id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
                keep_alive,
                client: builder.build(https),
            }),
        }
    }

    /// Whether idle connections are kept for reuse.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    /// True when both handles share one pool.
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn request(&self, request: http::Request<RequestBody>) -> ResponseFuture {
        self.inner.client.request(request)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("keep_alive", &self.inner.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    keep_alive: bool,
    tls: TlsOptions,
    idle_timeout: Duration,
    connect_timeout: Option<Duration>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            keep_alive: false,
            tls: TlsOptions::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: None,
        }
    }
}

impl AgentBuilder {
    /// Keep idle connections for reuse.
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// TLS parameters for HTTPS connections.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// How long a pooled connection may stay idle.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Limit on TCP connection establishment.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the agent.
    pub fn build(self) -> Result<Agent, TlsError> {
        let config = Arc::new(tls::client_config(&self.tls)?);
        Ok(Agent::assemble(
            config,
            self.keep_alive,
            self.idle_timeout,
            self.connect_timeout,
        ))
    }
}

//! Per-endpoint admission queues.
//!
//! Requests are grouped by endpoint (`scheme://host:port/`). Each endpoint
//! owns a FIFO of queued requests and an outstanding counter bounded by its
//! own ceiling; a client-wide counter bounds the sum. The [`Registry`] owns
//! every endpoint of one client and is always accessed under a single lock,
//! so the two-counter admission check and the dequeue happen atomically.

use std::collections::VecDeque;
use std::fmt;

use hashbrown::HashMap;
use url::Url;

use crate::agent::Agent;
use crate::error::ClientError;

/// Endpoint identity: `scheme://host:port/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Key for `url`, with the scheme's default port filled in.
    pub fn from_url(url: &Url) -> Result<Self, ClientError> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(ClientError::UnsupportedProtocol(url.as_str().to_owned())),
        }
        let host = url.host_str().ok_or_else(|| ClientError::InvalidUrl {
            url: url.as_str().to_owned(),
            reason: "missing host".to_owned(),
        })?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(Self(format!("{}://{host}:{port}/", url.scheme())))
    }

    /// The key as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One destination's queue and counters.
#[derive(Debug)]
pub(crate) struct Endpoint<R> {
    max_concurrent: usize,
    outstanding: usize,
    requests: VecDeque<R>,
    agent: Option<Agent>,
}

impl<R> Endpoint<R> {
    fn new(max_concurrent: usize, agent: Option<Agent>) -> Self {
        Self {
            max_concurrent,
            outstanding: 0,
            requests: VecDeque::new(),
            agent,
        }
    }

    /// Append `request` to the queue.
    pub(crate) fn enqueue(&mut self, request: R) {
        self.requests.push_back(request);
    }

    /// The endpoint's private keep-alive agent, if it has one.
    pub(crate) fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }
}

/// Client-wide outstanding counter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalLimit {
    outstanding: usize,
    max_concurrent: usize,
}

/// Every endpoint of one client plus the global counter.
#[derive(Debug)]
pub(crate) struct Registry<R> {
    endpoints: HashMap<EndpointKey, Endpoint<R>>,
    global: GlobalLimit,
}

impl<R> Registry<R> {
    pub(crate) fn new(max_total_concurrent: usize) -> Self {
        Self {
            endpoints: HashMap::new(),
            global: GlobalLimit {
                outstanding: 0,
                max_concurrent: max_total_concurrent,
            },
        }
    }

    /// Look up `key`, creating the endpoint with `max_concurrent` and the
    /// agent from `agent` if it does not exist yet.
    pub(crate) fn endpoint(
        &mut self,
        key: &EndpointKey,
        max_concurrent: usize,
        agent: impl FnOnce() -> Option<Agent>,
    ) -> &mut Endpoint<R> {
        self.endpoints.entry(key.clone()).or_insert_with(|| {
            let agent = agent();
            crate::tracing_compat::debug!(
                endpoint = %key,
                max_concurrent,
                private_agent = agent.is_some(),
                "endpoint created"
            );
            Endpoint::new(max_concurrent, agent)
        })
    }

    /// Pop the head of `key`'s queue if both ceilings allow another
    /// outstanding request, counting it as outstanding.
    pub(crate) fn admit_next(&mut self, key: &EndpointKey) -> Option<R> {
        let endpoint = self.endpoints.get_mut(key)?;
        if endpoint.requests.is_empty()
            || endpoint.outstanding >= endpoint.max_concurrent
            || self.global.outstanding >= self.global.max_concurrent
        {
            return None;
        }
        let request = endpoint.requests.pop_front()?;
        endpoint.outstanding += 1;
        self.global.outstanding += 1;
        Some(request)
    }

    /// Release one outstanding request of `key`.
    pub(crate) fn complete(&mut self, key: &EndpointKey) {
        if let Some(endpoint) = self.endpoints.get_mut(key) {
            debug_assert!(endpoint.outstanding > 0, "completion without dispatch");
            endpoint.outstanding = endpoint.outstanding.saturating_sub(1);
        }
        debug_assert!(self.global.outstanding > 0, "completion without dispatch");
        self.global.outstanding = self.global.outstanding.saturating_sub(1);
    }

    /// Endpoints other than `except` that still have queued requests.
    pub(crate) fn backlogged(&self, except: &EndpointKey) -> Vec<EndpointKey> {
        self.endpoints
            .iter()
            .filter(|(key, endpoint)| *key != except && !endpoint.requests.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Detach every private agent so its pool is dropped.
    pub(crate) fn take_private_agents(&mut self) -> Vec<Agent> {
        self.endpoints
            .values_mut()
            .filter_map(|endpoint| endpoint.agent.take())
            .collect()
    }

    pub(crate) fn stats(&self) -> ClientStats {
        let mut endpoints: Vec<EndpointStats> = self
            .endpoints
            .iter()
            .map(|(key, endpoint)| EndpointStats {
                endpoint: key.clone(),
                outstanding: endpoint.outstanding,
                max_concurrent: endpoint.max_concurrent,
                queued: endpoint.requests.len(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        ClientStats {
            outstanding: self.global.outstanding,
            max_total_concurrent: self.global.max_concurrent,
            endpoints,
        }
    }
}

/// Counters of one endpoint at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    /// Endpoint key.
    pub endpoint: EndpointKey,
    /// Dispatched, not yet completed.
    pub outstanding: usize,
    /// Per-endpoint ceiling.
    pub max_concurrent: usize,
    /// Waiting for admission.
    pub queued: usize,
}

/// Snapshot of a client's admission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    /// Dispatched, not yet completed, across all endpoints.
    pub outstanding: usize,
    /// Client-wide ceiling.
    pub max_total_concurrent: usize,
    /// Per-endpoint counters, sorted by key.
    pub endpoints: Vec<EndpointStats>,
}

impl ClientStats {
    /// Total queued requests across all endpoints.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.endpoints.iter().map(|e| e.queued).sum()
    }
}

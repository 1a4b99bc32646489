//! The client facade.
//!
//! [`HttpClient`] validates a call, resolves its options, finds or creates
//! the endpoint for each URL, enqueues the requests and schedules a drain.
//! Nothing touches the network inside the call: the returned futures and
//! streams exist before any dispatch happens.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use hashbrown::HashMap;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method, Uri};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use tokio::runtime::Handle;
use url::Url;

use crate::agent::Agent;
use crate::config::{ClientConfig, RequestOptions, ResolvedOptions};
use crate::dispatch::{Dispatcher, Payload, PendingRequest};
use crate::duplex::{DuplexHandle, DuplexStream};
use crate::endpoint::{ClientStats, EndpointKey};
use crate::error::ClientError;
use crate::response::{Completions, RequestDescriptor, ResponseFuture};
use crate::tls::{self, TlsOptions};
use crate::tracing_compat::{debug, info};

/// A value applied to every request of a batch, or one value per request.
///
/// `Each` is consumed left to right; requests beyond its end get
/// `T::default()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Many<T> {
    /// Same value for every request.
    One(T),
    /// One value per request, in URL order.
    Each(Vec<T>),
}

impl<T: Default> Default for Many<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}

impl<T: Clone + Default> Many<T> {
    fn expand(self, count: usize) -> Vec<T> {
        match self {
            Self::One(value) => vec![value; count],
            Self::Each(values) => values
                .into_iter()
                .chain(std::iter::repeat_with(T::default))
                .take(count)
                .collect(),
        }
    }
}

/// Concurrency-limited HTTP client.
///
/// Cloning is cheap; clones share queues, counters and agents.
///
/// # Examples
///
/// ```no_run
/// use http::HeaderMap;
/// use throttled_http::{HttpClient, RequestOptions};
///
/// # async fn demo() -> Result<(), throttled_http::ClientError> {
/// let client = HttpClient::new()?;
/// let response = client
///     .get("http://localhost:8080/ok", HeaderMap::new(), &RequestOptions::new())?
///     .await?;
/// assert_eq!(response.status_code, 200);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
    shared_agent: Agent,
    dedicated_agents: Mutex<HashMap<(TlsOptions, bool), Agent>>,
    dispatcher: Arc<Dispatcher>,
}

/// A validated destination.
#[derive(Debug)]
struct Target {
    key: EndpointKey,
    uri: Uri,
    headers: HeaderMap,
    descriptor: RequestDescriptor,
}

impl HttpClient {
    /// Client with default configuration on the current Tokio runtime.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_config(ClientConfig::default())
    }

    /// Client with `config` on the current Tokio runtime.
    pub fn with_config(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_handle(config, Handle::try_current()?)
    }

    /// Client with `config` whose requests run on `runtime`.
    pub fn with_handle(config: ClientConfig, runtime: Handle) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = Arc::new(tls::client_config(&config.tls)?);
        let shared_agent = Agent::with_tls_config(Arc::clone(&tls), false);
        let dispatcher = Arc::new(Dispatcher::new(config.max_total_concurrent, runtime));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                tls,
                shared_agent,
                dedicated_agents: Mutex::new(HashMap::new()),
                dispatcher,
            }),
        })
    }

    /// The configuration the client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Snapshot of queue and outstanding counters.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        self.inner.dispatcher.registry.lock().stats()
    }

    /// Release the private keep-alive agents this client created.
    ///
    /// Agents supplied through configuration or options are left alone.
    /// Requests already dispatched keep their connections until they finish.
    pub fn close(&self) {
        let private = self.inner.dispatcher.registry.lock().take_private_agents();
        let dedicated: Vec<Agent> = self
            .inner
            .dedicated_agents
            .lock()
            .drain()
            .map(|(_, agent)| agent)
            .collect();
        info!(
            endpoint_agents = private.len(),
            dedicated_agents = dedicated.len(),
            "client closed"
        );
        drop(private);
        drop(dedicated);
    }

    /// Issue one request with an optional fixed body.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        options: &RequestOptions,
    ) -> Result<ResponseFuture, ClientError> {
        let mut futures = self.request_batch(
            method,
            [url],
            Many::One(headers),
            Many::One(body),
            options,
        )?;
        futures.pop().ok_or(ClientError::Cancelled)
    }

    /// Issue one request per URL.
    ///
    /// The returned futures resolve in *completion* order: the first future
    /// yields whichever response finishes first. Use
    /// [`HttpResponse::request`](crate::HttpResponse::request) to correlate.
    pub fn request_batch<I, U>(
        &self,
        method: Method,
        urls: I,
        headers: Many<HeaderMap>,
        bodies: Many<Option<Bytes>>,
        options: &RequestOptions,
    ) -> Result<Vec<ResponseFuture>, ClientError>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let urls: Vec<U> = urls.into_iter().collect();
        reject_stream_flags(options, urls.len())?;
        options.validate()?;
        let resolved = self.inner.config.resolve(options);

        let headers = headers.expand(urls.len());
        let targets = urls
            .iter()
            .zip(headers)
            .map(|(url, headers)| target(&method, url.as_ref(), headers))
            .collect::<Result<Vec<_>, _>>()?;
        let payloads = bodies.expand(urls.len()).into_iter().map(|body| match body {
            Some(data) if !data.is_empty() => Payload::Fixed(data),
            _ => Payload::Empty,
        });

        let (completions, futures) = Completions::new(targets.len());
        let requests = targets
            .into_iter()
            .zip(payloads)
            .map(|(target, payload)| (target, payload, None))
            .collect();
        self.submit(&method, requests, &resolved, &completions)?;
        Ok(futures)
    }

    /// Issue a streaming request.
    ///
    /// Which directions stream depends on the flags in `options`: `stream`
    /// (or no flag) streams both, `write_stream` alone buffers the response
    /// into the response future, `read_stream` alone sends an empty body.
    pub fn request_stream(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        options: &RequestOptions,
    ) -> Result<DuplexStream, ClientError> {
        options.validate()?;
        let resolved = self.inner.config.resolve(options);
        let target = target(&method, url, headers)?;

        let (completions, mut futures) = Completions::new(1);
        let future = futures.pop().ok_or(ClientError::Cancelled)?;
        let (stream, handle) = DuplexStream::new(resolved.mode, resolved.write_buffer_size, future);
        let payload = if resolved.mode.writes() {
            Payload::Streaming
        } else {
            Payload::Empty
        };
        self.submit(&method, vec![(target, payload, Some(handle))], &resolved, &completions)?;
        Ok(stream)
    }

    fn submit(
        &self,
        method: &Method,
        requests: Vec<(Target, Payload, Option<DuplexHandle>)>,
        resolved: &ResolvedOptions,
        completions: &Completions,
    ) -> Result<(), ClientError> {
        let dedicated = match (&resolved.agent, resolved.tls_override) {
            (None, true) => Some(self.dedicated_agent(&resolved.tls, resolved.keep_alive)?),
            _ => None,
        };
        let queued_at = SystemTime::now();
        let queued = Instant::now();

        let mut scheduled: Vec<EndpointKey> = Vec::new();
        {
            let mut registry = self.inner.dispatcher.registry.lock();
            for (target, payload, duplex) in requests {
                let endpoint = registry.endpoint(&target.key, resolved.max_concurrent, || {
                    resolved
                        .keep_alive
                        .then(|| Agent::with_tls_config(Arc::clone(&self.inner.tls), true))
                });
                let agent = resolved
                    .agent
                    .clone()
                    .or_else(|| dedicated.clone())
                    .or_else(|| endpoint.agent().cloned())
                    .unwrap_or_else(|| self.inner.shared_agent.clone());
                endpoint.enqueue(PendingRequest {
                    method: method.clone(),
                    uri: target.uri,
                    headers: target.headers,
                    payload,
                    timeout: resolved.timeout,
                    max_response_size: resolved.max_response_size,
                    auto_content_decoding: resolved.auto_content_decoding,
                    agent,
                    completions: completions.clone(),
                    duplex,
                    queued_at,
                    queued,
                    descriptor: target.descriptor,
                });
                if !scheduled.contains(&target.key) {
                    scheduled.push(target.key);
                }
            }
        }
        debug!(
            method = %method,
            requests = completions.remaining(),
            endpoints = scheduled.len(),
            "requests queued"
        );
        for key in scheduled {
            self.inner.dispatcher.schedule(key);
        }
        Ok(())
    }

    fn dedicated_agent(&self, tls: &TlsOptions, keep_alive: bool) -> Result<Agent, ClientError> {
        let cache_key = (tls.clone(), keep_alive);
        if let Some(agent) = self.inner.dedicated_agents.lock().get(&cache_key) {
            return Ok(agent.clone());
        }
        let config = Arc::new(tls::client_config(tls)?);
        let agent = Agent::with_tls_config(config, keep_alive);
        Ok(self
            .inner
            .dedicated_agents
            .lock()
            .entry(cache_key)
            .or_insert(agent)
            .clone())
    }
}

macro_rules! without_body {
    ($($name:ident, $batch:ident => $method:ident;)*) => {
        impl HttpClient {
            $(
                #[doc = concat!("`", stringify!($method), "` request.")]
                pub fn $name(
                    &self,
                    url: &str,
                    headers: HeaderMap,
                    options: &RequestOptions,
                ) -> Result<ResponseFuture, ClientError> {
                    self.request(Method::$method, url, headers, None, options)
                }

                #[doc = concat!("`", stringify!($method), "` request per URL, resolving in completion order.")]
                pub fn $batch<I, U>(
                    &self,
                    urls: I,
                    headers: Many<HeaderMap>,
                    options: &RequestOptions,
                ) -> Result<Vec<ResponseFuture>, ClientError>
                where
                    I: IntoIterator<Item = U>,
                    U: AsRef<str>,
                {
                    self.request_batch(Method::$method, urls, headers, Many::One(None), options)
                }
            )*
        }
    };
}

macro_rules! with_body {
    ($($name:ident, $batch:ident => $method:ident;)*) => {
        impl HttpClient {
            $(
                #[doc = concat!("`", stringify!($method), "` request with a fixed body.")]
                pub fn $name(
                    &self,
                    url: &str,
                    headers: HeaderMap,
                    body: impl Into<Bytes>,
                    options: &RequestOptions,
                ) -> Result<ResponseFuture, ClientError> {
                    self.request(Method::$method, url, headers, Some(body.into()), options)
                }

                #[doc = concat!("`", stringify!($method), "` request per URL, resolving in completion order.")]
                pub fn $batch<I, U>(
                    &self,
                    urls: I,
                    headers: Many<HeaderMap>,
                    bodies: Many<Option<Bytes>>,
                    options: &RequestOptions,
                ) -> Result<Vec<ResponseFuture>, ClientError>
                where
                    I: IntoIterator<Item = U>,
                    U: AsRef<str>,
                {
                    self.request_batch(Method::$method, urls, headers, bodies, options)
                }
            )*
        }
    };
}

macro_rules! streaming {
    ($($name:ident => $method:ident;)*) => {
        impl HttpClient {
            $(
                #[doc = concat!("Streaming `", stringify!($method), "` request.")]
                pub fn $name(
                    &self,
                    url: &str,
                    headers: HeaderMap,
                    options: &RequestOptions,
                ) -> Result<DuplexStream, ClientError> {
                    self.request_stream(Method::$method, url, headers, options)
                }
            )*
        }
    };
}

without_body! {
    get, get_batch => GET;
    delete, delete_batch => DELETE;
    head, head_batch => HEAD;
}

with_body! {
    post, post_batch => POST;
    put, put_batch => PUT;
    patch, patch_batch => PATCH;
}

streaming! {
    get_stream => GET;
    post_stream => POST;
    put_stream => PUT;
    patch_stream => PATCH;
    delete_stream => DELETE;
}

fn reject_stream_flags(options: &RequestOptions, urls: usize) -> Result<(), ClientError> {
    if !options.is_streaming() {
        return Ok(());
    }
    let message = if urls > 1 {
        "stream can not be mixed with batch"
    } else {
        "stream options require request_stream"
    };
    Err(ClientError::InvalidUsage(message.to_owned()))
}

fn target(method: &Method, url: &str, headers: HeaderMap) -> Result<Target, ClientError> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: url.to_owned(),
        reason,
    };
    let mut parsed = Url::parse(url).map_err(|err| invalid(err.to_string()))?;
    let key = EndpointKey::from_url(&parsed)?;
    let descriptor = RequestDescriptor {
        method: method.clone(),
        url: url.to_owned(),
        headers: headers.clone(),
    };

    let mut headers = headers;
    if !parsed.username().is_empty() || parsed.password().is_some() {
        if !headers.contains_key(AUTHORIZATION) {
            let credentials = format!(
                "{}:{}",
                percent_decode_str(parsed.username()).decode_utf8_lossy(),
                percent_decode_str(parsed.password().unwrap_or_default()).decode_utf8_lossy()
            );
            let value = HeaderValue::try_from(format!("Basic {}", STANDARD.encode(credentials)))
                .map_err(|err| invalid(err.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        if parsed
            .set_username("")
            .and_then(|()| parsed.set_password(None))
            .is_err()
        {
            debug!(url, "could not strip credentials from url");
        }
    }
    parsed.set_fragment(None);
    let uri = parsed
        .as_str()
        .parse::<Uri>()
        .map_err(|err| invalid(err.to_string()))?;

    Ok(Target {
        key,
        uri,
        headers,
        descriptor,
    })
}

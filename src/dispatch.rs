//! Queue draining and per-request execution.
//!
//! [`Dispatcher::schedule`] spawns a drain of one endpoint. A drain admits
//! queued requests while both ceilings allow and spawns [`run`] for each; it
//! never waits. Every admitted request owns an [`OutstandingSlot`] whose drop
//! releases the two counters exactly once and schedules new drains, so a
//! request frees its slot on every path: success, timeout, transport error,
//! destroyed stream, panic or runtime shutdown.
//!
//! A request moves through these phases:
//!
//! ```text
//! Queued -> Sent -> Sending -> AwaitingResponse -> ReceivingHeaders
//!        -> ReceivingBody -> Completed
//! ```
//!
//! and ends in exactly one [`Terminal`] outcome, delivered once through the
//! request's completion list.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::agent::Agent;
use crate::body::{self, FixedBody, RequestBody, ResponseBody};
use crate::decode::ContentEncoding;
use crate::duplex::DuplexHandle;
use crate::endpoint::{EndpointKey, Registry};
use crate::error::{ClientError, HttpClientError, HttpErrorKind};
use crate::response::{Completions, HttpResponse, RequestDescriptor, ResponseHeaders};
use crate::timing::{Milestone, TimingRecorder};
use crate::tracing_compat::{debug, trace, warn};

/// Request body source.
#[derive(Debug)]
pub(crate) enum Payload {
    Empty,
    Fixed(Bytes),
    /// Pulled from the request's duplex stream.
    Streaming,
}

/// A request waiting in an endpoint queue.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) payload: Payload,
    pub(crate) timeout: Duration,
    pub(crate) max_response_size: usize,
    pub(crate) auto_content_decoding: bool,
    pub(crate) agent: Agent,
    pub(crate) completions: Completions,
    pub(crate) duplex: Option<DuplexHandle>,
    pub(crate) queued_at: SystemTime,
    pub(crate) queued: Instant,
    pub(crate) descriptor: RequestDescriptor,
}

/// Where a request is in its lifecycle, derived from its recorded milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Queued,
    Sent,
    Sending,
    AwaitingResponse,
    ReceivingHeaders,
    ReceivingBody,
    Completed,
}

impl Phase {
    fn of(timings: &TimingRecorder) -> Self {
        if timings.is_marked(Milestone::ResponseReceived) {
            Self::Completed
        } else if timings.is_marked(Milestone::ResponseDataStarted) {
            Self::ReceivingBody
        } else if timings.is_marked(Milestone::InitialResponse) {
            Self::ReceivingHeaders
        } else if timings.is_marked(Milestone::RequestSent) {
            Self::AwaitingResponse
        } else if timings.is_marked(Milestone::RequestDataStarted) {
            Self::Sending
        } else if timings.is_marked(Milestone::InitialRequest) {
            Self::Sent
        } else {
            Self::Queued
        }
    }
}

/// How a dispatched request ended.
#[derive(Debug)]
enum Terminal {
    Complete(Box<HttpResponse>),
    TooLarge { status: u16 },
    Timeout,
    Transport(hyper_util::client::legacy::Error),
    Body(io::Error),
    Destroyed,
}

/// Owns a client's endpoint registry and spawns drains on its runtime.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub(crate) registry: Mutex<Registry<PendingRequest>>,
    runtime: Handle,
}

impl Dispatcher {
    pub(crate) fn new(max_total_concurrent: usize, runtime: Handle) -> Self {
        Self {
            registry: Mutex::new(Registry::new(max_total_concurrent)),
            runtime,
        }
    }

    /// Drain `key` on a fresh task.
    pub(crate) fn schedule(self: &Arc<Self>, key: EndpointKey) {
        let this = Arc::clone(self);
        drop(self.runtime.spawn(async move { this.drain(&key) }));
    }

    fn drain(self: &Arc<Self>, key: &EndpointKey) {
        loop {
            let admitted = self.registry.lock().admit_next(key);
            let Some(request) = admitted else {
                break;
            };
            debug!(
                endpoint = %key,
                method = %request.method,
                url = %request.descriptor.url,
                "dispatching request"
            );
            let slot = OutstandingSlot {
                dispatcher: Arc::clone(self),
                key: key.clone(),
            };
            drop(self.runtime.spawn(run(request, slot)));
        }
    }
}

/// One admitted request's share of its endpoint and global ceilings.
///
/// Dropping the slot releases both counters and schedules drains of the
/// same endpoint and of every other endpoint with queued requests.
#[derive(Debug)]
pub(crate) struct OutstandingSlot {
    dispatcher: Arc<Dispatcher>,
    key: EndpointKey,
}

impl Drop for OutstandingSlot {
    fn drop(&mut self) {
        let backlogged = {
            let mut registry = self.dispatcher.registry.lock();
            registry.complete(&self.key);
            registry.backlogged(&self.key)
        };
        trace!(endpoint = %self.key, others = backlogged.len(), "slot released");
        self.dispatcher.schedule(self.key.clone());
        for key in backlogged {
            self.dispatcher.schedule(key);
        }
    }
}

/// Settings `exchange` needs besides the transport request.
struct Exchange<'a> {
    agent: &'a Agent,
    timeout: Duration,
    max_response_size: usize,
    auto_content_decoding: bool,
    reader: Option<&'a DuplexHandle>,
    timings: &'a Arc<TimingRecorder>,
    descriptor: &'a RequestDescriptor,
}

/// Execute one admitted request and deliver its outcome.
pub(crate) async fn run(request: PendingRequest, slot: OutstandingSlot) {
    let PendingRequest {
        method,
        uri,
        headers,
        payload,
        timeout,
        max_response_size,
        auto_content_decoding,
        agent,
        completions,
        duplex,
        queued_at,
        queued,
        descriptor,
    } = request;

    let timings = Arc::new(TimingRecorder::new(queued_at, queued));
    let mut slot = Some(slot);
    let mut status = None;

    let terminal = if duplex.as_ref().is_some_and(DuplexHandle::is_destroyed) {
        Terminal::Destroyed
    } else {
        let body: RequestBody = match payload {
            Payload::Empty => body::empty(),
            Payload::Fixed(data) => FixedBody::new(data, Arc::clone(&timings)).boxed(),
            Payload::Streaming => match &duplex {
                Some(handle) if handle.mode().writes() => {
                    http_body_util::BodyExt::boxed_unsync(handle.attach_request(Arc::clone(&timings)))
                }
                _ => body::empty(),
            },
        };
        let mut transport_request = http::Request::new(body);
        *transport_request.method_mut() = method;
        *transport_request.uri_mut() = uri;
        *transport_request.headers_mut() = headers;
        timings.mark(Milestone::InitialRequest);

        let exchange = Exchange {
            agent: &agent,
            timeout,
            max_response_size,
            auto_content_decoding,
            reader: duplex.as_ref().filter(|handle| handle.mode().reads()),
            timings: &timings,
            descriptor: &descriptor,
        };
        match &duplex {
            Some(handle) => {
                tokio::select! {
                    biased;
                    () = handle.destroyed() => Terminal::Destroyed,
                    terminal = exchange.run(transport_request, &mut status, &mut slot) => terminal,
                }
            }
            None => exchange.run(transport_request, &mut status, &mut slot).await,
        }
    };

    let result = settle(terminal, status, &timings, descriptor);
    if let (Err(err), Some(handle)) = (&result, &duplex) {
        let kind = match err {
            ClientError::Http(http) if http.kind == HttpErrorKind::Timeout => io::ErrorKind::TimedOut,
            ClientError::StreamDestroyed => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        handle.fail(io::Error::new(kind, err.to_string()));
    }
    drop(slot);
    if !completions.complete(result) {
        trace!("response future dropped before completion");
    }
}

impl Exchange<'_> {
    async fn run(
        &self,
        request: http::Request<RequestBody>,
        status: &mut Option<u16>,
        slot: &mut Option<OutstandingSlot>,
    ) -> Terminal {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let response = match tokio::time::timeout_at(deadline, self.agent.request(request)).await {
            Err(_elapsed) => return Terminal::Timeout,
            Ok(Err(err)) => return Terminal::Transport(err),
            Ok(Ok(response)) => response,
        };
        self.timings.mark(Milestone::InitialResponse);

        let (parts, incoming) = response.into_parts();
        *status = Some(parts.status.as_u16());
        let encoding = if self.auto_content_decoding {
            ContentEncoding::from_headers(&parts.headers)
        } else {
            ContentEncoding::Identity
        };
        let status_message = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .or_else(|| parts.status.canonical_reason().map(str::to_owned))
            .unwrap_or_default();
        let mut body = ResponseBody::new(incoming, encoding, Arc::clone(self.timings));
        let respond = |data: Bytes| {
            Terminal::Complete(Box::new(HttpResponse {
                status_code: parts.status.as_u16(),
                status_message: status_message.clone(),
                headers: ResponseHeaders::from_header_map(&parts.headers),
                data,
                timings: self.timings.snapshot(),
                request: self.descriptor.clone(),
            }))
        };

        if let Some(reader) = self.reader {
            if let Some(slot) = slot.take() {
                body.hold(slot);
            }
            body.idle_timeout(self.timeout);
            reader.attach_response(body);
            return respond(Bytes::new());
        }

        let limit = self.max_response_size;
        body.limit_decoded(limit);
        let status = parts.status.as_u16();
        match tokio::time::timeout_at(deadline, collect(&mut body, limit, status)).await {
            Err(_elapsed) => Terminal::Timeout,
            Ok(Err(terminal)) => terminal,
            Ok(Ok(data)) => respond(data),
        }
    }
}

/// Buffer the whole decoded body, stopping as soon as it exceeds `limit`.
async fn collect(body: &mut ResponseBody, limit: usize, status: u16) -> Result<Bytes, Terminal> {
    let mut data = BytesMut::new();
    while let Some(chunk) = body.chunk().await {
        let chunk = chunk.map_err(Terminal::Body)?;
        if data.len() + chunk.len() > limit {
            return Err(Terminal::TooLarge { status });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

fn settle(
    terminal: Terminal,
    status: Option<u16>,
    timings: &TimingRecorder,
    descriptor: RequestDescriptor,
) -> Result<HttpResponse, ClientError> {
    let phase = Phase::of(timings);
    match terminal {
        Terminal::Complete(response) => {
            debug!(
                url = %descriptor.url,
                status = response.status_code,
                bytes = response.data.len(),
                "request completed"
            );
            Ok(*response)
        }
        Terminal::TooLarge { status } => {
            timings.close_out();
            warn!(url = %descriptor.url, status, "response too large");
            Err(HttpClientError::new(
                HttpErrorKind::ResponseTooLarge,
                Some(status),
                timings.snapshot(),
                descriptor,
            )
            .into())
        }
        Terminal::Timeout => {
            timings.close_out();
            warn!(url = %descriptor.url, phase = ?phase, "request timed out");
            Err(HttpClientError::new(HttpErrorKind::Timeout, status, timings.snapshot(), descriptor).into())
        }
        Terminal::Transport(err) => {
            debug!(url = %descriptor.url, phase = ?phase, error = %err, "transport error");
            Err(ClientError::Transport(err))
        }
        Terminal::Body(err) => {
            debug!(url = %descriptor.url, error = %err, "response body failed");
            Err(ClientError::Io(err))
        }
        Terminal::Destroyed => {
            debug!(url = %descriptor.url, phase = ?phase, "stream destroyed");
            Err(ClientError::StreamDestroyed)
        }
    }
}

//! Response types and completion plumbing.
//!
//! A request's outcome travels from the dispatcher to the caller through a
//! oneshot channel. Batch requests share one [`Completions`] list: every
//! physical completion takes the *head* of the list, so the i-th future of a
//! batch resolves with the i-th response to finish, not the i-th URL.
//! [`HttpResponse::request`] echoes the originating request for correlation.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_lite::Stream;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::timing::Timings;

/// Result delivered by a [`ResponseFuture`].
pub type ResponseResult = Result<HttpResponse, ClientError>;

/// The request a response (or error) belongs to.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Request method.
    pub method: Method,
    /// Request URL as given by the caller.
    pub url: String,
    /// Request headers as given by the caller.
    pub headers: HeaderMap,
}

/// Response headers in arrival order.
///
/// Repeated headers are joined with `", "`, except `set-cookie`, whose values
/// cannot be joined and keep one entry each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    /// Build from a transport header map.
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut entries = Vec::with_capacity(map.keys_len());
        for name in map.keys() {
            let values = map
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
            if name == http::header::SET_COOKIE {
                entries.extend(values.map(|value| (name.as_str().to_owned(), value)));
            } else {
                let joined = values.collect::<Vec<_>>().join(", ");
                entries.push((name.as_str().to_owned(), joined));
            }
        }
        Self { entries }
    }

    /// First value for `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name` (more than one only for `set-cookie`).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterate `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A completed HTTP exchange.
///
/// For streamed responses `data` is empty; the body is read from the
/// [`DuplexStream`](crate::DuplexStream) instead.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status_code: u16,
    /// Reason phrase as sent by the server (canonical phrase if none).
    pub status_message: String,
    /// Response headers.
    pub headers: ResponseHeaders,
    /// Body bytes, decoded when auto content decoding applied.
    pub data: Bytes,
    /// Lifecycle timings.
    pub timings: Timings,
    /// The originating request.
    pub request: RequestDescriptor,
}

impl HttpResponse {
    /// The body as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// True for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        StatusCode::from_u16(self.status_code).is_ok_and(|status| status.is_success())
    }
}

/// Resolves with the outcome of one request.
///
/// Dropping a `ResponseFuture` does not cancel the request; it still runs to
/// its terminal event and releases its concurrency slot.
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<ResponseResult>,
}

impl Future for ResponseFuture {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(ClientError::Cancelled)),
        }
    }
}

/// Ordered completion slots shared by the requests of one call.
#[derive(Debug, Clone)]
pub(crate) struct Completions {
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<ResponseResult>>>>,
}

impl Completions {
    /// Create `count` completion slots and their futures, in order.
    pub(crate) fn new(count: usize) -> (Self, Vec<ResponseFuture>) {
        let mut waiters = VecDeque::with_capacity(count);
        let mut futures = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = oneshot::channel();
            waiters.push_back(tx);
            futures.push(ResponseFuture { rx });
        }
        (
            Self {
                waiters: Arc::new(Mutex::new(waiters)),
            },
            futures,
        )
    }

    /// Deliver `result` to the earliest unresolved slot.
    ///
    /// Returns false when no slot remained or its future was dropped.
    pub(crate) fn complete(&self, result: ResponseResult) -> bool {
        let waiter = self.waiters.lock().pop_front();
        waiter.is_some_and(|tx| tx.send(result).is_ok())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// The futures of a batch as a [`Stream`].
///
/// Items are yielded in the order of the underlying futures; for futures
/// from [`HttpClient::request_batch`](crate::HttpClient::request_batch) that
/// is completion order. Rejections are yielded as `Err` items rather than
/// ending the stream.
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct BatchResponses {
    pending: VecDeque<ResponseFuture>,
}

impl BatchResponses {
    /// Number of responses not yet yielded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True once every response has been yielded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl From<Vec<ResponseFuture>> for BatchResponses {
    fn from(futures: Vec<ResponseFuture>) -> Self {
        Self {
            pending: futures.into(),
        }
    }
}

impl Stream for BatchResponses {
    type Item = ResponseResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(front) = self.pending.front_mut() else {
            return Poll::Ready(None);
        };
        let result = ready!(Pin::new(front).poll(cx));
        self.pending.pop_front();
        Poll::Ready(Some(result))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}

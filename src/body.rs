//! Request and response body adapters.
//!
//! [`FixedBody`] sends a caller-supplied buffer and records when the
//! transport took it and when it asked past it. [`ResponseBody`] decodes an
//! incoming body chunk by chunk, records the response-side milestones, and
//! can hold the request's concurrency slot until the body is finished,
//! failed, idle for too long or dropped.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use tokio::time::{Instant, Sleep};

use crate::decode::{ContentDecoder, ContentEncoding};
use crate::dispatch::OutstandingSlot;
use crate::timing::{Milestone, TimingRecorder};

/// Boxed error used by body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body type accepted by [`Agent`](crate::Agent) transports.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

pub(crate) fn empty() -> RequestBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A complete in-memory request body.
#[derive(Debug)]
pub(crate) struct FixedBody {
    data: Option<Bytes>,
    taken: bool,
    timings: Arc<TimingRecorder>,
}

impl FixedBody {
    pub(crate) fn new(data: Bytes, timings: Arc<TimingRecorder>) -> Self {
        Self {
            data: Some(data).filter(|data| !data.is_empty()),
            taken: false,
            timings,
        }
    }

    fn mark_sent(&self) {
        if self.taken {
            self.timings.mark(Milestone::RequestSent);
        }
    }

    pub(crate) fn boxed(self) -> RequestBody {
        self.boxed_unsync()
    }
}

impl Body for FixedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let Some(data) = self.data.take() else {
            self.mark_sent();
            return Poll::Ready(None);
        };
        self.taken = true;
        self.timings.mark(Milestone::RequestDataStarted);
        Poll::Ready(Some(Ok(Frame::data(data))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.data.as_ref().map_or(0, |data| data.len() as u64))
    }
}

// The transport stops polling once `is_end_stream` turns true and drops the
// body after writing its last frame.
impl Drop for FixedBody {
    fn drop(&mut self) {
        self.mark_sent();
    }
}

/// Fails a stalled response body after `timeout` without a new frame.
struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            armed: false,
        }
    }

    /// The body has nothing ready. Starts the wait on the first call after
    /// progress and reports whether it ran out.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.armed {
            self.armed = true;
            self.sleep.as_mut().reset(Instant::now() + self.timeout);
        }
        self.sleep.as_mut().poll(cx).is_ready()
    }

    fn progress(&mut self) {
        self.armed = false;
    }
}

/// A decoded response body.
pub(crate) struct ResponseBody {
    inner: UnsyncBoxBody<Bytes, BoxError>,
    decoder: ContentDecoder,
    timings: Arc<TimingRecorder>,
    slot: Option<OutstandingSlot>,
    idle: Option<IdleTimer>,
    decoded: usize,
    max_decoded: Option<usize>,
    finished: bool,
}

impl ResponseBody {
    pub(crate) fn new<B>(body: B, encoding: ContentEncoding, timings: Arc<TimingRecorder>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: body.map_err(Into::into).boxed_unsync(),
            decoder: ContentDecoder::new(encoding),
            timings,
            slot: None,
            idle: None,
            decoded: 0,
            max_decoded: None,
            finished: false,
        }
    }

    /// Keep `slot` outstanding until the body ends, fails or is dropped.
    pub(crate) fn hold(&mut self, slot: OutstandingSlot) {
        self.slot = Some(slot);
    }

    /// Fail with [`io::ErrorKind::TimedOut`] once the transport has had
    /// nothing for `timeout` while a chunk is wanted. Needs a Tokio runtime.
    pub(crate) fn idle_timeout(&mut self, timeout: Duration) {
        self.idle = Some(IdleTimer::new(timeout));
    }

    /// Stop decoding once more than `limit` decoded bytes were produced.
    /// The chunk that crosses `limit` is still returned so the caller can
    /// see it did.
    pub(crate) fn limit_decoded(&mut self, limit: usize) {
        self.max_decoded = Some(limit);
    }

    /// Next decoded chunk. Never yields an empty chunk.
    pub(crate) fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            let frame = match Pin::new(&mut self.inner).poll_frame(cx) {
                Poll::Ready(frame) => frame,
                Poll::Pending => {
                    if self.idle.as_mut().is_some_and(|idle| idle.poll_expired(cx)) {
                        let err = io::Error::new(io::ErrorKind::TimedOut, "Timeout");
                        return Poll::Ready(Some(Err(self.fail(err))));
                    }
                    return Poll::Pending;
                }
            };
            if let Some(idle) = self.idle.as_mut() {
                idle.progress();
            }
            match frame {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    self.timings.mark(Milestone::ResponseDataStarted);
                    let budget = self
                        .max_decoded
                        .map_or(usize::MAX, |max| max.saturating_sub(self.decoded).saturating_add(1));
                    match self.decoder.decode(data, budget) {
                        Ok(decoded) if decoded.is_empty() => {}
                        Ok(decoded) => {
                            self.decoded += decoded.len();
                            return Poll::Ready(Some(Ok(decoded)));
                        }
                        Err(err) => return Poll::Ready(Some(Err(self.fail(err)))),
                    }
                }
                Some(Err(err)) => {
                    let err = io::Error::other(err);
                    return Poll::Ready(Some(Err(self.fail(err))));
                }
                None => {
                    let tail = self.decoder.finish();
                    self.end();
                    return match tail {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(tail))),
                        Err(err) => Poll::Ready(Some(Err(err))),
                    };
                }
            }
        }
    }

    /// Await the next decoded chunk.
    pub(crate) async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.end();
        err
    }

    fn end(&mut self) {
        self.finished = true;
        self.timings.mark(Milestone::ResponseReceived);
        self.slot.take();
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("decoder", &self.decoder)
            .field("holds_slot", &self.slot.is_some())
            .field("idle_timeout", &self.idle.as_ref().map(|idle| idle.timeout))
            .field("decoded", &self.decoded)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

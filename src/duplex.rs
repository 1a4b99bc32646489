//! Bidirectional stream handed to the caller before the request exists.
//!
//! A [`DuplexStream`] is returned synchronously by the streaming entry
//! points, while the request is still queued. Both directions are backed by
//! one shared state object:
//!
//! * writes land in a bounded buffer until the dispatcher calls
//!   [`DuplexHandle::attach_request`]; from then on the transport pulls the
//!   buffered chunks, in order, through a [`DuplexBody`];
//! * reads register as pending until [`DuplexHandle::attach_response`] hands
//!   over the decoded response body; from then on reads are served from it.
//!
//! Destroying the stream (explicitly, or by dropping it while the exchange
//! still needs it) aborts the transport request and the response body, each
//! at most once, and wakes the dispatcher so a queued or in-flight request is
//! rejected with [`ClientError::StreamDestroyed`](crate::ClientError).

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use http_body::{Body, Frame};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

use crate::body::{BoxError, ResponseBody};
use crate::config::StreamMode;
use crate::response::ResponseFuture;
use crate::timing::{Milestone, TimingRecorder};
use crate::tracing_compat::debug;

#[derive(Debug)]
struct Shared {
    mode: StreamMode,
    capacity: usize,

    writes: VecDeque<Bytes>,
    buffered: usize,
    write_ended: bool,
    request_attached: bool,
    request_released: bool,
    write_waker: Option<Waker>,
    body_waker: Option<Waker>,
    request_timings: Option<Arc<TimingRecorder>>,

    source: Option<ResponseBody>,
    leftover: Bytes,
    read_pending: bool,
    read_waker: Option<Waker>,
    read_eof: bool,
    read_error: Option<io::Error>,

    failed: bool,
    destroyed: bool,
}

impl Shared {
    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn wake_body(&mut self) {
        if let Some(waker) = self.body_waker.take() {
            waker.wake();
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn read_finished(&self) -> bool {
        !self.mode.reads() || self.read_eof
    }

    fn write_finished(&self) -> bool {
        !self.mode.writes() || self.write_ended
    }

    /// Serve one read from the leftover chunk or the attached body.
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.mode.reads() {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = self.read_error.take() {
            self.read_eof = true;
            return Poll::Ready(Err(err));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.remaining());
                buf.put_slice(&self.leftover[..n]);
                self.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }
            if self.destroyed {
                return Poll::Ready(Err(destroyed_error()));
            }
            let Some(source) = self.source.as_mut() else {
                self.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            };
            match source.poll_chunk(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => self.leftover = chunk,
                Poll::Ready(Some(Err(err))) => {
                    self.source = None;
                    self.read_eof = true;
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(None) => {
                    self.source = None;
                    self.read_eof = true;
                }
            }
        }
    }
}

fn destroyed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream destroyed")
}

/// Caller side of a streaming request.
///
/// Implements [`AsyncWrite`] for the request body and [`AsyncRead`] for the
/// decoded response body. Call [`AsyncWriteExt::shutdown`] to end the
/// request body.
///
/// Dropping the stream destroys the request unless it is no longer needed:
/// in write-only mode once the body was ended, otherwise once the response
/// body was read to its end.
///
/// [`AsyncWriteExt::shutdown`]: tokio::io::AsyncWriteExt::shutdown
#[derive(Debug)]
pub struct DuplexStream {
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    response: Option<ResponseFuture>,
}

/// Dispatcher side of a [`DuplexStream`].
#[derive(Debug, Clone)]
pub(crate) struct DuplexHandle {
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
}

impl DuplexStream {
    pub(crate) fn new(
        mode: StreamMode,
        capacity: usize,
        response: ResponseFuture,
    ) -> (Self, DuplexHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            mode,
            capacity: capacity.max(1),
            writes: VecDeque::new(),
            buffered: 0,
            write_ended: false,
            request_attached: false,
            request_released: false,
            write_waker: None,
            body_waker: None,
            request_timings: None,
            source: None,
            leftover: Bytes::new(),
            read_pending: false,
            read_waker: None,
            read_eof: false,
            read_error: None,
            failed: false,
            destroyed: false,
        }));
        let notify = Arc::new(Notify::new());
        let handle = DuplexHandle {
            shared: Arc::clone(&shared),
            notify: Arc::clone(&notify),
        };
        (
            Self {
                shared,
                notify,
                response: Some(response),
            },
            handle,
        )
    }

    /// Take the future resolving with the response head (and, in write-only
    /// mode, the buffered body). Returns `None` after the first call.
    pub fn take_response(&mut self) -> Option<ResponseFuture> {
        self.response.take()
    }

    /// True while the last read is still waiting, either for dispatch or for
    /// response data.
    #[must_use]
    pub fn is_pending_read(&self) -> bool {
        let shared = self.shared.lock();
        shared.read_pending && !shared.read_eof
    }

    /// True once [`destroy`](Self::destroy) ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Abort the request and the response body. Idempotent.
    pub fn destroy(&self) {
        let source = {
            let mut shared = self.shared.lock();
            if shared.destroyed {
                return;
            }
            shared.destroyed = true;
            shared.writes.clear();
            shared.buffered = 0;
            shared.wake_body();
            shared.wake_writer();
            shared.wake_reader();
            shared.source.take()
        };
        debug!(
            aborted_body = source.is_some(),
            "duplex stream destroyed"
        );
        // Dropped outside the lock: releasing the body may release a slot.
        drop(source);
        self.notify.notify_one();
    }
}

impl Drop for DuplexStream {
    fn drop(&mut self) {
        let needed = {
            let shared = self.shared.lock();
            let done = match shared.mode {
                StreamMode::WriteOnly => shared.write_finished(),
                StreamMode::Duplex | StreamMode::ReadOnly => shared.read_finished(),
            };
            !(done || shared.failed)
        };
        if needed {
            self.destroy();
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.shared.lock();
        if shared.destroyed {
            return Poll::Ready(Err(destroyed_error()));
        }
        if !shared.mode.writes() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "request body is not streamed",
            )));
        }
        if shared.write_ended {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after end",
            )));
        }
        if shared.failed || shared.request_released {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "request is no longer accepting data",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let room = shared.capacity.saturating_sub(shared.buffered);
        if room == 0 {
            shared.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = room.min(buf.len());
        shared.writes.push_back(Bytes::copy_from_slice(&buf[..n]));
        shared.buffered += n;
        shared.wake_body();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        if shared.destroyed {
            return Poll::Ready(Err(destroyed_error()));
        }
        if shared.writes.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if shared.failed || shared.request_released {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "request dropped before buffered data was sent",
            )));
        }
        shared.write_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        if shared.destroyed {
            return Poll::Ready(Err(destroyed_error()));
        }
        shared.write_ended = true;
        shared.wake_body();
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        let poll = shared.poll_read(cx, buf);
        shared.read_pending = poll.is_pending();
        poll
    }
}

impl DuplexHandle {
    pub(crate) fn mode(&self) -> StreamMode {
        self.shared.lock().mode
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Resolves once the caller destroyed the stream.
    pub(crate) async fn destroyed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_destroyed() {
                return;
            }
            notified.await;
        }
    }

    /// Start feeding buffered writes to the transport.
    pub(crate) fn attach_request(&self, timings: Arc<TimingRecorder>) -> DuplexBody {
        let mut shared = self.shared.lock();
        shared.request_attached = true;
        shared.request_timings = Some(timings);
        DuplexBody {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Serve reads from `body`. Dropped at once if the stream was destroyed.
    pub(crate) fn attach_response(&self, body: ResponseBody) {
        let rejected = {
            let mut shared = self.shared.lock();
            if shared.destroyed || !shared.mode.reads() {
                Some(body)
            } else {
                shared.source = Some(body);
                shared.wake_reader();
                None
            }
        };
        drop(rejected);
    }

    /// The request ended without a readable body; surface `err` to pending
    /// readers and writers.
    pub(crate) fn fail(&self, err: io::Error) {
        let mut shared = self.shared.lock();
        shared.failed = true;
        if shared.mode.reads() && shared.source.is_none() && !shared.read_eof {
            shared.read_error = Some(err);
        }
        shared.wake_reader();
        shared.wake_writer();
    }
}

/// Request body pulled by the transport from a [`DuplexStream`]'s buffer.
#[derive(Debug)]
pub(crate) struct DuplexBody {
    shared: Arc<Mutex<Shared>>,
}

impl Body for DuplexBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut shared = self.shared.lock();
        if shared.destroyed {
            return Poll::Ready(Some(Err(Box::new(destroyed_error()))));
        }
        if let Some(chunk) = shared.writes.pop_front() {
            shared.buffered -= chunk.len();
            if let Some(timings) = &shared.request_timings {
                timings.mark(Milestone::RequestDataStarted);
            }
            shared.wake_writer();
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        if shared.write_ended {
            if let Some(timings) = &shared.request_timings {
                timings.mark(Milestone::RequestSent);
            }
            return Poll::Ready(None);
        }
        shared.body_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        let shared = self.shared.lock();
        !shared.destroyed && shared.write_ended && shared.writes.is_empty()
    }
}

impl Drop for DuplexBody {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.request_released = true;
        if shared.write_ended && shared.writes.is_empty() {
            if let Some(timings) = &shared.request_timings {
                timings.mark(Milestone::RequestSent);
            }
        }
        shared.wake_writer();
    }
}

//! Request lifecycle timing.
//!
//! A [`TimingRecorder`] is shared between the dispatcher and the body
//! adapters of one request. Each milestone is written at most once; the
//! first write wins. [`TimingRecorder::snapshot`] derives the public
//! [`Timings`] deltas, substituting the previous milestone for any that never
//! happened (a request without a body has its data-start equal to its
//! request-start, a response without a body has its data-start equal to its
//! head arrival, and so on).

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

/// A lifecycle milestone of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Milestone {
    /// Transport request object created.
    InitialRequest,
    /// First request body byte handed to the transport.
    RequestDataStarted,
    /// Request body fully handed to the transport.
    RequestSent,
    /// Response status line and headers received.
    InitialResponse,
    /// First response body chunk received.
    ResponseDataStarted,
    /// Response body fully received (or the request hit a terminal event).
    ResponseReceived,
}

impl Milestone {
    const ALL: [Self; 6] = [
        Self::InitialRequest,
        Self::RequestDataStarted,
        Self::RequestSent,
        Self::InitialResponse,
        Self::ResponseDataStarted,
        Self::ResponseReceived,
    ];

    const fn index(self) -> usize {
        match self {
            Self::InitialRequest => 0,
            Self::RequestDataStarted => 1,
            Self::RequestSent => 2,
            Self::InitialResponse => 3,
            Self::ResponseDataStarted => 4,
            Self::ResponseReceived => 5,
        }
    }
}

/// Monotonic durations between request lifecycle milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Wall-clock time the request was queued.
    pub queued: SystemTime,
    /// Queued → transport request created.
    pub initial_request: Duration,
    /// Transport request created → first body byte handed to the transport.
    pub request_data_started: Duration,
    /// First body byte → body fully handed to the transport.
    pub request_sent: Duration,
    /// Body fully sent → response head received.
    pub initial_response: Duration,
    /// Response head → first body chunk.
    pub response_data_started: Duration,
    /// First body chunk → body fully received.
    pub response_received: Duration,
}

impl Timings {
    /// Sum of every delta: queued → response fully received.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.initial_request
            + self.request_data_started
            + self.request_sent
            + self.initial_response
            + self.response_data_started
            + self.response_received
    }
}

/// Write-once milestone recorder for one request.
#[derive(Debug)]
pub(crate) struct TimingRecorder {
    queued_at: SystemTime,
    queued: Instant,
    marks: [OnceLock<Instant>; 6],
}

impl TimingRecorder {
    pub(crate) fn new(queued_at: SystemTime, queued: Instant) -> Self {
        Self {
            queued_at,
            queued,
            marks: Default::default(),
        }
    }

    /// Record `milestone` now unless it was already recorded.
    pub(crate) fn mark(&self, milestone: Milestone) {
        self.mark_at(milestone, Instant::now());
    }

    pub(crate) fn mark_at(&self, milestone: Milestone, at: Instant) {
        let _ = self.marks[milestone.index()].set(at);
    }

    pub(crate) fn is_marked(&self, milestone: Milestone) -> bool {
        self.marks[milestone.index()].get().is_some()
    }

    /// Record every milestone that has not happened yet as "now".
    ///
    /// Used for timeouts, where the remaining phases collapse to the moment
    /// the deadline fired.
    pub(crate) fn close_out(&self) {
        let now = Instant::now();
        for milestone in Milestone::ALL {
            self.mark_at(milestone, now);
        }
    }

    /// Derive the public deltas from the recorded milestones.
    pub(crate) fn snapshot(&self) -> Timings {
        let mut resolved = [self.queued; 6];
        let mut previous = self.queued;
        for milestone in Milestone::ALL {
            let at = self.marks[milestone.index()]
                .get()
                .copied()
                .unwrap_or(previous);
            resolved[milestone.index()] = at;
            previous = at;
        }

        let delta = |from: Instant, to: Instant| to.saturating_duration_since(from);
        Timings {
            queued: self.queued_at,
            initial_request: delta(self.queued, resolved[0]),
            request_data_started: delta(resolved[0], resolved[1]),
            request_sent: delta(resolved[1], resolved[2]),
            initial_response: delta(resolved[2], resolved[3]),
            response_data_started: delta(resolved[3], resolved[4]),
            response_received: delta(resolved[4], resolved[5]),
        }
    }
}

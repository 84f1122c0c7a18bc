//! The two-deep capture/release intent queue.
//!
//! `pending` is the in-flight operation, `target` the terminal state the
//! most recent request asked for. A new request only ever updates
//! `target`; identical requests coalesce, and a conflicting request
//! cancels the in-flight operation where possible. Queue depth is
//! therefore bounded at two regardless of request pile-up.

use serde::{Deserialize, Serialize};

use super::AvailabilityState;
use crate::event::ConnectivityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureRequest {
    Capture,
    Release,
}

/// What the supervisor should do about a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Already at, or already heading to, the requested state.
    Coalesced,
    /// Nothing in flight; start the operation.
    Start(CaptureRequest),
    /// An opposing operation is in flight; cancel it, then the
    /// supervisor proceeds to `target` when the cancel lands.
    CancelInFlight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentQueue {
    /// Link state as last confirmed by the transport. `None` until the
    /// first address assignment.
    pub connected: Option<CaptureRequest>,
    pub pending: Option<CaptureRequest>,
    pub target: Option<CaptureRequest>,
}

impl IntentQueue {
    pub fn request(&mut self, req: CaptureRequest) -> RequestAction {
        if self.target == Some(req) {
            return RequestAction::Coalesced;
        }
        self.target = Some(req);
        match self.pending {
            None if self.connected == Some(req) => RequestAction::Coalesced,
            None => RequestAction::Start(req),
            Some(pending) if pending == req => RequestAction::Coalesced,
            Some(_) => RequestAction::CancelInFlight,
        }
    }

    /// The transport confirmed the link is now in `state`.
    pub fn settle(&mut self, state: CaptureRequest) {
        self.connected = Some(state);
        self.pending = None;
    }

    /// The in-flight operation failed without changing the link.
    pub fn fail_pending(&mut self) {
        self.pending = None;
    }

    /// Whatever the queue says still needs doing.
    pub fn outstanding(&self) -> Option<CaptureRequest> {
        match self.target {
            Some(t) if self.connected != Some(t) => Some(t),
            _ => None,
        }
    }

    pub fn availability(&self) -> AvailabilityState {
        match self.pending {
            Some(CaptureRequest::Capture) => AvailabilityState::Capturing,
            Some(CaptureRequest::Release) => AvailabilityState::Releasing,
            None => match self.outstanding() {
                Some(CaptureRequest::Capture) => AvailabilityState::Capturing,
                Some(CaptureRequest::Release) => AvailabilityState::Releasing,
                None => match self.connected {
                    None => AvailabilityState::Initial,
                    Some(CaptureRequest::Capture) => AvailabilityState::Captured,
                    Some(CaptureRequest::Release) => AvailabilityState::Released,
                },
            },
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        match self.availability() {
            AvailabilityState::Initial => ConnectivityState::Initial,
            AvailabilityState::Capturing => ConnectivityState::Connecting,
            AvailabilityState::Captured | AvailabilityState::Ready => ConnectivityState::Connected,
            AvailabilityState::NotReady => ConnectivityState::NotReady,
            AvailabilityState::Releasing => ConnectivityState::Disconnecting,
            AvailabilityState::Released => ConnectivityState::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_queue_is_initial() {
        let q = IntentQueue::default();
        assert_eq!(q.availability(), AvailabilityState::Initial);
    }

    #[test]
    fn capture_from_released_starts() {
        let mut q = IntentQueue {
            connected: Some(CaptureRequest::Release),
            ..Default::default()
        };
        assert_eq!(
            q.request(CaptureRequest::Capture),
            RequestAction::Start(CaptureRequest::Capture)
        );
        q.pending = Some(CaptureRequest::Capture);
        assert_eq!(q.availability(), AvailabilityState::Capturing);
    }

    #[test]
    fn identical_requests_coalesce() {
        let mut q = IntentQueue {
            connected: Some(CaptureRequest::Release),
            ..Default::default()
        };
        q.request(CaptureRequest::Capture);
        q.pending = Some(CaptureRequest::Capture);
        assert_eq!(q.request(CaptureRequest::Capture), RequestAction::Coalesced);
        assert_eq!(q.request(CaptureRequest::Capture), RequestAction::Coalesced);
    }

    #[test]
    fn opposing_request_cancels_in_flight() {
        let mut q = IntentQueue {
            connected: Some(CaptureRequest::Release),
            ..Default::default()
        };
        q.request(CaptureRequest::Capture);
        q.pending = Some(CaptureRequest::Capture);
        assert_eq!(
            q.request(CaptureRequest::Release),
            RequestAction::CancelInFlight
        );
        assert_eq!(q.target, Some(CaptureRequest::Release));
        // The cancel lands as a settled release.
        q.settle(CaptureRequest::Release);
        assert_eq!(q.availability(), AvailabilityState::Released);
    }

    #[test]
    fn capture_during_releasing_is_queued_as_target() {
        let mut q = IntentQueue {
            connected: Some(CaptureRequest::Capture),
            pending: Some(CaptureRequest::Release),
            target: Some(CaptureRequest::Release),
        };
        assert_eq!(
            q.request(CaptureRequest::Capture),
            RequestAction::CancelInFlight
        );
        // Release completes anyway; outstanding target says what's next.
        q.settle(CaptureRequest::Release);
        assert_eq!(q.outstanding(), Some(CaptureRequest::Capture));
    }

    #[test]
    fn release_when_released_is_a_no_op() {
        let mut q = IntentQueue {
            connected: Some(CaptureRequest::Release),
            ..Default::default()
        };
        assert_eq!(q.request(CaptureRequest::Release), RequestAction::Coalesced);
        assert_eq!(q.availability(), AvailabilityState::Released);
    }
}

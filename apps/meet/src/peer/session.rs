use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meet_proto::{ConnectionId, IceCandidate, SessionDescription};

use super::connection::{ConnectionState, MediaConnection, RemoteTrack};
use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but nothing exchanged yet.
    Idle,
    /// Local offer under construction.
    Offering,
    /// Local offer sent, waiting for the answer.
    OfferPending,
    /// Remote offer received, answer under construction.
    AnsweringPending,
    /// Last exchange completed; signaling is stable.
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationResult<T> {
    Ok(T),
    TimedOut,
    Failed(String),
}

impl<T> NegotiationResult<T> {
    /// Race `work` against the watchdog.
    pub async fn race<F>(limit: Duration, work: F) -> Self
    where
        F: Future<Output = Result<T, ConnectionError>>,
    {
        match tokio::time::timeout(limit, work).await {
            Ok(Ok(value)) => NegotiationResult::Ok(value),
            Ok(Err(err)) => NegotiationResult::Failed(err.to_string()),
            Err(_) => NegotiationResult::TimedOut,
        }
    }
}

/// Negotiation-in-progress flag. Only a [`NegotiationGuard`] can set it and
/// dropping the guard always clears it, so a panicking or aborted step
/// cannot leave it stuck.
#[derive(Debug, Clone, Default)]
pub struct NegotiationFlag(Arc<AtomicBool>);

impl NegotiationFlag {
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn try_begin(&self) -> Option<NegotiationGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| NegotiationGuard(self.0.clone()))
    }
}

#[derive(Debug)]
pub struct NegotiationGuard(Arc<AtomicBool>);

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PeerSession {
    pub(crate) remote_id: ConnectionId,
    pub(crate) generation: u64,
    pub(crate) connection: Arc<dyn MediaConnection>,
    pub(crate) state: SessionState,
    pub(crate) transport: ConnectionState,
    pub(crate) flag: NegotiationFlag,
    /// Bumped every time an offer goes out; stale answer timers compare it.
    pub(crate) epoch: u64,
    pub(crate) negotiated: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    pub(crate) outgoing_candidates: Vec<IceCandidate>,
    pub(crate) parked_offer: Option<SessionDescription>,
    pub(crate) renegotiate_requested: bool,
    pub(crate) known_from_roster: bool,
    pub(crate) remote_tracks: Vec<RemoteTrack>,
}

impl PeerSession {
    pub(crate) fn new(
        remote_id: ConnectionId,
        generation: u64,
        connection: Arc<dyn MediaConnection>,
        known_from_roster: bool,
    ) -> Self {
        Self {
            remote_id,
            generation,
            connection,
            state: SessionState::Idle,
            transport: ConnectionState::New,
            flag: NegotiationFlag::default(),
            epoch: 0,
            negotiated: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            outgoing_candidates: Vec::new(),
            parked_offer: None,
            renegotiate_requested: false,
            known_from_roster,
            remote_tracks: Vec::new(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> ConnectionState {
        self.transport
    }

    pub fn is_negotiating(&self) -> bool {
        self.flag.is_busy()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    /// Stable, connected and with nothing queued.
    pub fn is_settled(&self) -> bool {
        self.state == SessionState::Connected
            && self.transport == ConnectionState::Connected
            && !self.flag.is_busy()
            && !self.renegotiate_requested
            && self.parked_offer.is_none()
    }

    /// State to fall back to once an exchange ends.
    pub(crate) fn stable_state(&self) -> SessionState {
        if self.negotiated {
            SessionState::Connected
        } else {
            SessionState::Idle
        }
    }

    /// Local candidates wait until the description they belong to is sent.
    pub(crate) fn holds_local_candidates(&self) -> bool {
        matches!(
            self.state,
            SessionState::Idle | SessionState::Offering | SessionState::AnsweringPending
        )
    }

    /// The lexicographically lower id yields during glare.
    pub(crate) fn is_polite(&self, local_id: &str) -> bool {
        local_id < self.remote_id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn guard_drop_clears_flag() {
        let flag = NegotiationFlag::default();
        let guard = flag.try_begin().unwrap();
        assert!(flag.is_busy());
        assert!(flag.try_begin().is_none());
        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.try_begin().is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn race_reports_each_outcome() {
        let limit = Duration::from_millis(50);
        let ok: NegotiationResult<u8> = NegotiationResult::race(limit, async { Ok(7) }).await;
        assert_eq!(ok, NegotiationResult::Ok(7));

        let failed: NegotiationResult<u8> =
            NegotiationResult::race(limit, async { Err(ConnectionError::Closed) }).await;
        assert_eq!(failed, NegotiationResult::Failed("connection closed".into()));

        let timed_out: NegotiationResult<u8> =
            NegotiationResult::race(limit, std::future::pending()).await;
        assert_eq!(timed_out, NegotiationResult::TimedOut);
    }

    #[test_timeout::tokio_timeout_test]
    async fn flag_clears_when_step_is_aborted() {
        let flag = NegotiationFlag::default();
        let guard = flag.try_begin().unwrap();
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        task.abort();
        let _ = task.await;
        assert!(!flag.is_busy());
    }
}

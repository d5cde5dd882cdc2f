//! Peer Session Controller.
//!
//! Owns one [`PeerSession`] per remote member and drives it through the
//! offer/answer/candidate exchange relayed by the signaling server. Every
//! method runs on the meeting loop; slow negotiation steps are spawned,
//! raced against the watchdog, and report back as [`PeerInput::Negotiated`].
//!
//! Glare is resolved with fixed roles: the peer with the lexicographically
//! lower connection id is polite. A polite peer abandons its own offer and
//! answers the remote one; an impolite peer ignores an offer that collides
//! with its own.

pub mod connection;
pub mod mock;
pub mod session;
pub mod webrtc;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meet_proto::{ClientMessage, ConnectionId, IceCandidate, SessionDescription, SignalPayload};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub use connection::{
    ConnectionEvent, ConnectionEvents, ConnectionState, MediaConnection, MediaConnector,
    RemoteTrack,
};
pub use session::{NegotiationFlag, NegotiationGuard, NegotiationResult, PeerSession, SessionState};

use crate::error::ConnectionError;
use crate::media::{MediaChange, MediaTrack};

/// Everything that feeds back into the controller from spawned work.
#[derive(Debug)]
pub enum PeerInput {
    Connection {
        remote_id: ConnectionId,
        generation: u64,
        event: ConnectionEvent,
    },
    /// Carries the step's guard so the session stays busy until the
    /// outcome has been folded in on the meeting loop.
    Negotiated {
        remote_id: ConnectionId,
        generation: u64,
        outcome: NegotiationOutcome,
        guard: NegotiationGuard,
    },
    /// An offer went out `2 × negotiation_timeout` ago.
    AnswerOverdue {
        remote_id: ConnectionId,
        generation: u64,
        epoch: u64,
    },
}

impl PeerInput {
    fn target(&self) -> (&str, u64) {
        match self {
            PeerInput::Connection {
                remote_id,
                generation,
                ..
            }
            | PeerInput::Negotiated {
                remote_id,
                generation,
                ..
            }
            | PeerInput::AnswerOverdue {
                remote_id,
                generation,
                ..
            } => (remote_id, *generation),
        }
    }
}

#[derive(Debug)]
pub enum NegotiationOutcome {
    Offer(NegotiationResult<SessionDescription>),
    Answer(NegotiationResult<SessionDescription>),
    ApplyAnswer(NegotiationResult<()>),
    Rollback(NegotiationResult<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Member left the room roster.
    Left,
    TransportLost(ConnectionState),
    Failed(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    SessionOpened {
        remote_id: ConnectionId,
    },
    Connected {
        remote_id: ConnectionId,
    },
    RemoteTrack {
        remote_id: ConnectionId,
        track: RemoteTrack,
    },
    NegotiationTimedOut {
        remote_id: ConnectionId,
    },
    SessionClosed {
        remote_id: ConnectionId,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub negotiation_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PeerController {
    local_id: ConnectionId,
    connector: Arc<dyn MediaConnector>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    inputs: mpsc::UnboundedSender<PeerInput>,
    config: PeerConfig,
    sessions: HashMap<ConnectionId, PeerSession>,
    /// Mirror of the tracks every session should be sending.
    local_tracks: Vec<Arc<MediaTrack>>,
    next_generation: u64,
    events: VecDeque<PeerEvent>,
}

impl PeerController {
    pub fn new(
        local_id: ConnectionId,
        connector: Arc<dyn MediaConnector>,
        signals: mpsc::UnboundedSender<ClientMessage>,
        config: PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerInput>) {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let controller = Self {
            local_id,
            connector,
            signals,
            inputs,
            config,
            sessions: HashMap::new(),
            local_tracks: Vec::new(),
            next_generation: 0,
            events: VecDeque::new(),
        };
        (controller, inputs_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn session(&self, remote_id: &str) -> Option<&PeerSession> {
        self.sessions.get(remote_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn local_tracks(&self) -> &[Arc<MediaTrack>] {
        &self.local_tracks
    }

    /// True when every session is connected with nothing in flight.
    pub fn is_settled(&self) -> bool {
        self.sessions.values().all(PeerSession::is_settled)
    }

    pub fn drain_events(&mut self) -> Vec<PeerEvent> {
        self.events.drain(..).collect()
    }

    /// Reconcile sessions with the server roster: open and offer to new
    /// members, close sessions whose member is gone, retry idle ones.
    pub async fn sync_roster(&mut self, remote_ids: &[ConnectionId]) {
        let wanted: HashSet<&str> = remote_ids
            .iter()
            .map(String::as_str)
            .filter(|id| *id != self.local_id)
            .collect();

        let departed: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.known_from_roster && !wanted.contains(s.remote_id.as_str()))
            .map(|s| s.remote_id.clone())
            .collect();
        for remote_id in departed {
            self.close_session(&remote_id, CloseReason::Left).await;
        }

        for remote_id in remote_ids {
            if *remote_id == self.local_id {
                continue;
            }
            match self.sessions.get_mut(remote_id) {
                Some(session) => {
                    session.known_from_roster = true;
                    if session.state == SessionState::Idle && !session.flag.is_busy() {
                        self.start_offer(remote_id);
                    }
                }
                None => {
                    if self.open_session(remote_id, true).await {
                        self.start_offer(remote_id);
                    }
                }
            }
        }
    }

    pub async fn handle_signal(&mut self, sender_id: ConnectionId, signal: SignalPayload) {
        if sender_id == self.local_id {
            return;
        }
        match signal {
            SignalPayload::Offer(offer) => self.on_remote_offer(sender_id, offer).await,
            SignalPayload::Answer(answer) => self.on_remote_answer(&sender_id, answer),
            SignalPayload::Candidate(candidate) => {
                self.on_remote_candidate(&sender_id, candidate).await
            }
        }
    }

    pub async fn handle_input(&mut self, input: PeerInput) {
        let (remote_id, generation) = input.target();
        if self.sessions.get(remote_id).map(|s| s.generation) != Some(generation) {
            trace!(target: "peer", remote_id, generation, "input for replaced session dropped");
            return;
        }
        match input {
            PeerInput::Connection {
                remote_id, event, ..
            } => self.on_connection_event(&remote_id, event).await,
            PeerInput::Negotiated {
                remote_id,
                outcome,
                guard,
                ..
            } => {
                // handlers below may start the next step
                drop(guard);
                self.on_negotiated(&remote_id, outcome).await
            }
            PeerInput::AnswerOverdue {
                remote_id, epoch, ..
            } => self.on_answer_overdue(&remote_id, epoch),
        }
    }

    async fn on_negotiated(&mut self, remote_id: &str, outcome: NegotiationOutcome) {
        match outcome {
            NegotiationOutcome::Offer(result) => self.on_offer_created(remote_id, result).await,
            NegotiationOutcome::Answer(result) => self.on_answer_created(remote_id, result).await,
            NegotiationOutcome::ApplyAnswer(result) => {
                self.on_answer_applied(remote_id, result).await
            }
            NegotiationOutcome::Rollback(result) => self.on_rolled_back(remote_id, result).await,
        }
    }

    /// Mirror a local media change onto every session. Mute toggles only
    /// flip shared track state; track swaps renegotiate.
    pub async fn apply_media_change(&mut self, change: &MediaChange) {
        match change {
            MediaChange::TrackEnabled { .. } => return,
            MediaChange::TrackAdded(track) => {
                if !self.local_tracks.iter().any(|t| t.id() == track.id()) {
                    self.local_tracks.push(track.clone());
                }
            }
            MediaChange::TrackReplaced { old, new } => {
                match self.local_tracks.iter().position(|t| t.id() == old.id()) {
                    Some(index) => self.local_tracks[index] = new.clone(),
                    None => self.local_tracks.push(new.clone()),
                }
            }
            MediaChange::TrackRemoved(track) => {
                self.local_tracks.retain(|t| t.id() != track.id());
            }
        }

        let remote_ids: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for remote_id in remote_ids {
            let Some(session) = self.sessions.get(&remote_id) else {
                continue;
            };
            let connection = session.connection.clone();
            let result = match change {
                MediaChange::TrackAdded(track) => connection.add_track(track.clone()).await,
                MediaChange::TrackReplaced { old, new } => {
                    connection.replace_track(old, new.clone()).await
                }
                MediaChange::TrackRemoved(track) => connection.remove_track(track).await,
                MediaChange::TrackEnabled { .. } => Ok(()),
            };
            match result {
                Ok(()) => self.start_offer(&remote_id),
                Err(err) => {
                    self.fail_session(&remote_id, format!("track update failed: {err}"))
                        .await
                }
            }
        }
    }

    pub async fn close_session(&mut self, remote_id: &str, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(remote_id) else {
            return;
        };
        session.state = SessionState::Closed;
        session.connection.close().await;
        info!(target: "peer", remote_id, ?reason, "peer session closed");
        self.events.push_back(PeerEvent::SessionClosed {
            remote_id: remote_id.to_string(),
            reason,
        });
    }

    pub async fn close_all(&mut self) {
        let remote_ids: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for remote_id in remote_ids {
            self.close_session(&remote_id, CloseReason::Shutdown).await;
        }
    }

    /// Non-async teardown for `Drop` paths: connections are closed on the
    /// current runtime if there is one.
    pub fn close_all_detached(&mut self) {
        let connections: Vec<Arc<dyn MediaConnection>> = self
            .sessions
            .drain()
            .map(|(_, session)| session.connection)
            .collect();
        if connections.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for connection in connections {
                    handle.spawn(async move { connection.close().await });
                }
            }
            Err(_) => debug!(target: "peer", "no runtime; dropping connections unclosed"),
        }
    }

    async fn open_session(&mut self, remote_id: &str, known_from_roster: bool) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = ConnectionEvents::new(remote_id.to_string(), generation, self.inputs.clone());
        let connection = match self.connector.connect(events).await {
            Ok(connection) => connection,
            Err(err) => {
                self.report_failure(remote_id, format!("connection setup failed: {err}"));
                return false;
            }
        };
        let tracks = self.local_tracks.clone();
        for track in tracks {
            if let Err(err) = connection.add_track(track).await {
                connection.close().await;
                self.report_failure(remote_id, format!("attaching local track failed: {err}"));
                return false;
            }
        }

        info!(target: "peer", remote_id, generation, known_from_roster, "peer session opened");
        self.sessions.insert(
            remote_id.to_string(),
            PeerSession::new(remote_id.to_string(), generation, connection, known_from_roster),
        );
        self.events.push_back(PeerEvent::SessionOpened {
            remote_id: remote_id.to_string(),
        });
        true
    }

    fn report_failure(&mut self, remote_id: &str, reason: String) {
        warn!(target: "peer", remote_id, %reason, "peer session failed");
        self.events.push_back(PeerEvent::SessionClosed {
            remote_id: remote_id.to_string(),
            reason: CloseReason::Failed(reason),
        });
    }

    async fn fail_session(&mut self, remote_id: &str, reason: String) {
        warn!(target: "peer", remote_id, %reason, "negotiation failed; tearing down session");
        self.close_session(remote_id, CloseReason::Failed(reason))
            .await;
    }

    /// Begin an offer, or remember that one is wanted if an exchange is
    /// already under way.
    fn start_offer(&mut self, remote_id: &str) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        if matches!(
            session.state,
            SessionState::Offering | SessionState::OfferPending | SessionState::AnsweringPending
        ) {
            session.renegotiate_requested = true;
            return;
        }
        let Some(guard) = session.flag.try_begin() else {
            session.renegotiate_requested = true;
            return;
        };
        session.renegotiate_requested = false;
        session.state = SessionState::Offering;
        debug!(target: "peer", remote_id, "creating offer");

        let connection = session.connection.clone();
        spawn_step(
            &self.inputs,
            self.config.negotiation_timeout,
            remote_id,
            session.generation,
            guard,
            NegotiationOutcome::Offer,
            async move {
                let offer = connection.create_offer().await?;
                connection.set_local_description(offer.clone()).await?;
                Ok(offer)
            },
        );
    }

    /// Answer `offer`, parking it if another exchange holds the flag.
    fn start_answer(&mut self, remote_id: &str, offer: SessionDescription) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        let Some(guard) = session.flag.try_begin() else {
            session.parked_offer = Some(offer);
            return;
        };
        session.state = SessionState::AnsweringPending;
        session.epoch += 1;
        debug!(target: "peer", remote_id, "answering offer");

        let connection = session.connection.clone();
        spawn_step(
            &self.inputs,
            self.config.negotiation_timeout,
            remote_id,
            session.generation,
            guard,
            NegotiationOutcome::Answer,
            async move {
                connection.rollback().await?;
                connection.set_remote_description(offer).await?;
                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                Ok(answer)
            },
        );
    }

    /// Run whatever queued up while the flag was held.
    fn after_exchange(&mut self, remote_id: &str) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        if session.flag.is_busy() {
            return;
        }
        if let Some(offer) = session.parked_offer.take() {
            self.start_answer(remote_id, offer);
        } else if session.renegotiate_requested {
            self.start_offer(remote_id);
        }
    }

    async fn on_remote_offer(&mut self, sender_id: ConnectionId, offer: SessionDescription) {
        if !self.sessions.contains_key(&sender_id) && !self.open_session(&sender_id, false).await
        {
            return;
        }
        let Some(session) = self.sessions.get_mut(&sender_id) else {
            return;
        };
        let polite = session.is_polite(&self.local_id);

        // Offering counts as an outstanding local offer even once the step
        // has finished and only its outcome is still queued.
        if session.state == SessionState::Offering && !polite {
            debug!(target: "peer", remote_id = %sender_id, "glare: keeping local offer");
            return;
        }
        if session.flag.is_busy() || session.state == SessionState::Offering {
            debug!(target: "peer", remote_id = %sender_id, state = ?session.state, "offer parked");
            session.parked_offer = Some(offer);
            return;
        }

        match session.state {
            SessionState::OfferPending if !polite => {
                debug!(target: "peer", remote_id = %sender_id, "glare: keeping local offer");
            }
            SessionState::OfferPending => {
                debug!(target: "peer", remote_id = %sender_id, "glare: yielding to remote offer");
                session.renegotiate_requested = true;
                self.start_answer(&sender_id, offer);
            }
            SessionState::Closed => {}
            _ => self.start_answer(&sender_id, offer),
        }
    }

    fn on_remote_answer(&mut self, sender_id: &str, answer: SessionDescription) {
        let Some(session) = self.sessions.get_mut(sender_id) else {
            debug!(target: "peer", remote_id = sender_id, "answer for unknown peer dropped");
            return;
        };
        if session.state != SessionState::OfferPending {
            debug!(target: "peer", remote_id = sender_id, state = ?session.state, "late answer ignored");
            return;
        }
        let Some(guard) = session.flag.try_begin() else {
            debug!(target: "peer", remote_id = sender_id, "answer ignored during another step");
            return;
        };
        session.epoch += 1;

        let connection = session.connection.clone();
        spawn_step(
            &self.inputs,
            self.config.negotiation_timeout,
            sender_id,
            session.generation,
            guard,
            NegotiationOutcome::ApplyAnswer,
            async move { connection.set_remote_description(answer).await },
        );
    }

    async fn on_remote_candidate(&mut self, sender_id: &str, candidate: IceCandidate) {
        let Some(session) = self.sessions.get_mut(sender_id) else {
            debug!(target: "peer", remote_id = sender_id, "candidate for unknown peer dropped");
            return;
        };
        if !session.remote_description_set {
            session.pending_candidates.push_back(candidate);
            return;
        }
        let connection = session.connection.clone();
        if let Err(err) = connection.add_ice_candidate(candidate).await {
            self.fail_session(sender_id, format!("candidate rejected: {err}"))
                .await;
        }
    }

    /// Flush candidates that arrived before the remote description.
    async fn apply_pending_candidates(&mut self, remote_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return false;
        };
        let queued: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
        let connection = session.connection.clone();
        for candidate in queued {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                self.fail_session(remote_id, format!("candidate rejected: {err}"))
                    .await;
                return false;
            }
        }
        true
    }

    async fn on_offer_created(
        &mut self,
        remote_id: &str,
        result: NegotiationResult<SessionDescription>,
    ) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        if session.state != SessionState::Offering {
            debug!(target: "peer", remote_id, state = ?session.state, "stale offer outcome dropped");
            self.after_exchange(remote_id);
            return;
        }
        match result {
            NegotiationResult::Ok(offer) => {
                if let Some(remote_offer) = session.parked_offer.take() {
                    debug!(target: "peer", remote_id, "glare: yielding to parked offer");
                    session.renegotiate_requested = true;
                    self.start_answer(remote_id, remote_offer);
                    return;
                }
                session.state = SessionState::OfferPending;
                session.epoch += 1;
                let (generation, epoch) = (session.generation, session.epoch);
                let outgoing = std::mem::take(&mut session.outgoing_candidates);
                send_signal(&self.signals, remote_id, SignalPayload::Offer(offer));
                for candidate in outgoing {
                    send_signal(&self.signals, remote_id, SignalPayload::Candidate(candidate));
                }
                self.arm_answer_timer(remote_id, generation, epoch);
            }
            NegotiationResult::TimedOut => {
                warn!(target: "peer", remote_id, "offer construction timed out");
                session.state = session.stable_state();
                self.events.push_back(PeerEvent::NegotiationTimedOut {
                    remote_id: remote_id.to_string(),
                });
                self.after_exchange(remote_id);
            }
            NegotiationResult::Failed(reason) => self.fail_session(remote_id, reason).await,
        }
    }

    async fn on_answer_created(
        &mut self,
        remote_id: &str,
        result: NegotiationResult<SessionDescription>,
    ) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        match result {
            NegotiationResult::Ok(answer) => {
                session.state = SessionState::Connected;
                session.negotiated = true;
                session.remote_description_set = true;
                let outgoing = std::mem::take(&mut session.outgoing_candidates);
                send_signal(&self.signals, remote_id, SignalPayload::Answer(answer));
                for candidate in outgoing {
                    send_signal(&self.signals, remote_id, SignalPayload::Candidate(candidate));
                }
                if self.apply_pending_candidates(remote_id).await {
                    self.after_exchange(remote_id);
                }
            }
            NegotiationResult::TimedOut => {
                warn!(target: "peer", remote_id, "answer construction timed out");
                session.state = session.stable_state();
                self.events.push_back(PeerEvent::NegotiationTimedOut {
                    remote_id: remote_id.to_string(),
                });
                self.after_exchange(remote_id);
            }
            NegotiationResult::Failed(reason) => self.fail_session(remote_id, reason).await,
        }
    }

    async fn on_answer_applied(&mut self, remote_id: &str, result: NegotiationResult<()>) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        match result {
            NegotiationResult::Ok(()) => {
                session.state = SessionState::Connected;
                session.negotiated = true;
                session.remote_description_set = true;
                if self.apply_pending_candidates(remote_id).await {
                    self.after_exchange(remote_id);
                }
            }
            NegotiationResult::TimedOut => {
                warn!(target: "peer", remote_id, "applying answer timed out");
                session.state = session.stable_state();
                self.events.push_back(PeerEvent::NegotiationTimedOut {
                    remote_id: remote_id.to_string(),
                });
                self.after_exchange(remote_id);
            }
            NegotiationResult::Failed(reason) => self.fail_session(remote_id, reason).await,
        }
    }

    async fn on_rolled_back(&mut self, remote_id: &str, result: NegotiationResult<()>) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        match result {
            NegotiationResult::Ok(()) | NegotiationResult::TimedOut => {
                session.state = session.stable_state();
                self.after_exchange(remote_id);
            }
            NegotiationResult::Failed(reason) => self.fail_session(remote_id, reason).await,
        }
    }

    /// Withdraw an offer nobody answered so later renegotiation is not
    /// blocked behind it.
    fn on_answer_overdue(&mut self, remote_id: &str, epoch: u64) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        if session.state != SessionState::OfferPending || session.epoch != epoch {
            return;
        }
        let Some(guard) = session.flag.try_begin() else {
            return;
        };
        warn!(target: "peer", remote_id, "offer unanswered; rolling back");
        self.events.push_back(PeerEvent::NegotiationTimedOut {
            remote_id: remote_id.to_string(),
        });

        let connection = session.connection.clone();
        spawn_step(
            &self.inputs,
            self.config.negotiation_timeout,
            remote_id,
            session.generation,
            guard,
            NegotiationOutcome::Rollback,
            async move { connection.rollback().await },
        );
    }

    fn arm_answer_timer(&self, remote_id: &str, generation: u64, epoch: u64) {
        let inputs = self.inputs.clone();
        let wait = self.config.negotiation_timeout * 2;
        let remote_id = remote_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = inputs.send(PeerInput::AnswerOverdue {
                remote_id,
                generation,
                epoch,
            });
        });
    }

    async fn on_connection_event(&mut self, remote_id: &str, event: ConnectionEvent) {
        let Some(session) = self.sessions.get_mut(remote_id) else {
            return;
        };
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                if session.holds_local_candidates() {
                    session.outgoing_candidates.push(candidate);
                } else {
                    send_signal(&self.signals, remote_id, SignalPayload::Candidate(candidate));
                }
            }
            ConnectionEvent::RemoteTrack(track) => {
                debug!(target: "peer", remote_id, track_id = %track.id, kind = ?track.kind, "remote track");
                session.remote_tracks.push(track.clone());
                self.events.push_back(PeerEvent::RemoteTrack {
                    remote_id: remote_id.to_string(),
                    track,
                });
            }
            ConnectionEvent::StateChanged(state) => {
                session.transport = state;
                if state == ConnectionState::Connected {
                    info!(target: "peer", remote_id, "media connection established");
                    self.events.push_back(PeerEvent::Connected {
                        remote_id: remote_id.to_string(),
                    });
                } else if state.is_terminal() {
                    self.close_session(remote_id, CloseReason::TransportLost(state))
                        .await;
                }
            }
        }
    }
}

fn send_signal(
    signals: &mpsc::UnboundedSender<ClientMessage>,
    remote_id: &str,
    payload: SignalPayload,
) {
    match payload.into_client_message(remote_id) {
        Ok(message) => {
            if signals.send(message).is_err() {
                debug!(target: "peer", remote_id, "signaling channel closed; signal dropped");
            }
        }
        Err(err) => warn!(target: "peer", remote_id, "failed to encode signal: {err}"),
    }
}

/// Spawn one negotiation step under the watchdog. The guard travels with
/// the outcome and is released by [`PeerController::handle_input`].
fn spawn_step<T, F>(
    inputs: &mpsc::UnboundedSender<PeerInput>,
    limit: Duration,
    remote_id: &str,
    generation: u64,
    guard: NegotiationGuard,
    wrap: fn(NegotiationResult<T>) -> NegotiationOutcome,
    work: F,
) where
    T: Send + 'static,
    F: Future<Output = Result<T, ConnectionError>> + Send + 'static,
{
    let inputs = inputs.clone();
    let remote_id = remote_id.to_string();
    tokio::spawn(async move {
        let result = NegotiationResult::race(limit, work).await;
        let _ = inputs.send(PeerInput::Negotiated {
            remote_id,
            generation,
            outcome: wrap(result),
            guard,
        });
    });
}

//! In-process media connection used by tests and headless runs.
//!
//! Descriptions are tiny SDP-like documents listing the sender's tracks as
//! `a=track:<id>:<kind>` lines. The connection enforces the offer/answer
//! signaling states, refuses candidates before a remote description and
//! reports `Connected` once signaling is stable and a remote candidate has
//! been applied.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meet_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use uuid::Uuid;

use super::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionState, MediaConnection, MediaConnector,
    RemoteTrack,
};
use crate::error::ConnectionError;
use crate::media::{MediaTrack, TrackKind};

static NEXT_PORT: AtomicU16 = AtomicU16::new(50_000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    #[default]
    Normal,
    /// `create_offer` never completes.
    HangOffers,
    /// Every remote description is rejected.
    RejectRemoteDescriptions,
}

#[derive(Default)]
pub struct MockConnector {
    behavior: Mutex<MockBehavior>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Applies to connections created afterwards.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Most recent connection created towards `remote_id`.
    pub fn latest(&self, remote_id: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|conn| conn.remote_id() == remote_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl MediaConnector for MockConnector {
    async fn connect(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        let connection = Arc::new(MockConnection::new(events, *self.behavior.lock()));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Inner {
    signaling: Signaling,
    local_tracks: Vec<Arc<MediaTrack>>,
    has_local: bool,
    has_remote: bool,
    remote_tracks: Vec<RemoteTrack>,
    remote_candidates: Vec<IceCandidate>,
    version: u64,
    connected: bool,
    closed: bool,
}

pub struct MockConnection {
    session_id: String,
    events: ConnectionEvents,
    behavior: MockBehavior,
    inner: Mutex<Inner>,
}

impl MockConnection {
    fn new(events: ConnectionEvents, behavior: MockBehavior) -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            events,
            behavior,
            inner: Mutex::new(Inner {
                signaling: Signaling::Stable,
                local_tracks: Vec::new(),
                has_local: false,
                has_remote: false,
                remote_tracks: Vec::new(),
                remote_candidates: Vec::new(),
                version: 0,
                connected: false,
                closed: false,
            }),
        }
    }

    pub fn remote_id(&self) -> &str {
        self.events.remote_id()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .local_tracks
            .iter()
            .map(|track| track.id().to_string())
            .collect()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.lock().remote_tracks.clone()
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.inner.lock().remote_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn render(&self, inner: &mut Inner) -> String {
        inner.version += 1;
        let mut sdp = format!(
            "v=0\r\no=mock {} {} IN IP4 127.0.0.1\r\n",
            self.session_id, inner.version
        );
        for track in &inner.local_tracks {
            let kind = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("a=track:{}:{}\r\n", track.id(), kind));
        }
        sdp
    }

    fn ensure_open(inner: &Inner) -> Result<(), ConnectionError> {
        if inner.closed {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Emits `Connected` the first time the connection becomes usable.
    fn check_connected(&self) {
        let ready = {
            let mut inner = self.inner.lock();
            let ready = !inner.connected
                && !inner.closed
                && inner.signaling == Signaling::Stable
                && inner.has_local
                && inner.has_remote
                && !inner.remote_candidates.is_empty();
            if ready {
                inner.connected = true;
            }
            ready
        };
        if ready {
            self.events
                .emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
    }
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=track:"))
        .filter_map(|rest| {
            let (id, kind) = rest.rsplit_once(':')?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            Some(RemoteTrack {
                id: id.to_string(),
                kind,
            })
        })
        .collect()
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.behavior == MockBehavior::HangOffers {
            std::future::pending::<()>().await;
        }
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let sdp = self.render(&mut inner);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.signaling != Signaling::HaveRemoteOffer {
            return Err(ConnectionError::InvalidDescription(
                "no remote offer to answer".into(),
            ));
        }
        let sdp = self.render(&mut inner);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let port = {
            let mut inner = self.inner.lock();
            Self::ensure_open(&inner)?;
            inner.signaling = match (description.kind, inner.signaling) {
                (SdpKind::Offer, Signaling::Stable) => Signaling::HaveLocalOffer,
                (SdpKind::Answer, Signaling::HaveRemoteOffer) => Signaling::Stable,
                (kind, state) => {
                    return Err(ConnectionError::InvalidDescription(format!(
                        "local {} in {state:?}",
                        kind.as_str()
                    )))
                }
            };
            inner.has_local = true;
            NEXT_PORT.fetch_add(1, Ordering::Relaxed)
        };
        self.events
            .emit(ConnectionEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        self.check_connected();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if self.behavior == MockBehavior::RejectRemoteDescriptions {
            return Err(ConnectionError::Rejected("remote description refused".into()));
        }
        let added = {
            let mut inner = self.inner.lock();
            Self::ensure_open(&inner)?;
            inner.signaling = match (description.kind, inner.signaling) {
                (SdpKind::Offer, Signaling::Stable) => Signaling::HaveRemoteOffer,
                (SdpKind::Answer, Signaling::HaveLocalOffer) => Signaling::Stable,
                (kind, state) => {
                    return Err(ConnectionError::InvalidDescription(format!(
                        "remote {} in {state:?}",
                        kind.as_str()
                    )))
                }
            };
            inner.has_remote = true;
            let known: HashSet<String> =
                inner.remote_tracks.iter().map(|t| t.id.clone()).collect();
            let added: Vec<RemoteTrack> = parse_tracks(&description.sdp)
                .into_iter()
                .filter(|track| !known.contains(&track.id))
                .collect();
            inner.remote_tracks.extend(added.iter().cloned());
            added
        };
        for track in added {
            self.events.emit(ConnectionEvent::RemoteTrack(track));
        }
        self.check_connected();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.signaling == Signaling::HaveLocalOffer {
            inner.signaling = Signaling::Stable;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock();
            Self::ensure_open(&inner)?;
            if !inner.has_remote {
                return Err(ConnectionError::InvalidDescription(
                    "candidate before remote description".into(),
                ));
            }
            inner.remote_candidates.push(candidate);
        }
        self.check_connected();
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if !inner.local_tracks.iter().any(|t| t.id() == track.id()) {
            inner.local_tracks.push(track);
        }
        Ok(())
    }

    async fn replace_track(
        &self,
        old: &MediaTrack,
        new: Arc<MediaTrack>,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let slot = inner
            .local_tracks
            .iter_mut()
            .find(|t| t.id() == old.id())
            .ok_or_else(|| ConnectionError::Rejected(format!("no sender for {}", old.id())))?;
        *slot = new;
        Ok(())
    }

    async fn remove_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        inner.local_tracks.retain(|t| t.id() != track.id());
        Ok(())
    }

    async fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if was_open {
            self.events
                .emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::peer::PeerInput;
    use tokio::sync::mpsc;

    async fn pair() -> (
        Arc<dyn MediaConnection>,
        Arc<dyn MediaConnection>,
        mpsc::UnboundedReceiver<PeerInput>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MockConnector::new();
        let a = connector
            .connect(ConnectionEvents::new("b".into(), 1, tx.clone()))
            .await
            .unwrap();
        let b = connector
            .connect(ConnectionEvents::new("a".into(), 1, tx))
            .await
            .unwrap();
        (a, b, rx)
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_exchange_connects_both_sides() {
        let (a, b, mut rx) = pair().await;
        a.add_track(MediaTrack::new(TrackSource::Microphone))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut candidates = Vec::new();
        let mut remote_tracks = Vec::new();
        while let Ok(input) = rx.try_recv() {
            if let PeerInput::Connection { remote_id, event, .. } = input {
                match event {
                    ConnectionEvent::LocalCandidate(c) => candidates.push((remote_id, c)),
                    ConnectionEvent::RemoteTrack(t) => remote_tracks.push(t),
                    ConnectionEvent::StateChanged(_) => {}
                }
            }
        }
        assert_eq!(candidates.len(), 2);
        assert_eq!(remote_tracks.len(), 1);
        assert_eq!(remote_tracks[0].kind, TrackKind::Audio);

        for (target, candidate) in candidates {
            let conn = if target == "b" { &b } else { &a };
            conn.add_ice_candidate(candidate).await.unwrap();
        }
        let mut connected = 0;
        while let Ok(input) = rx.try_recv() {
            if let PeerInput::Connection {
                event: ConnectionEvent::StateChanged(ConnectionState::Connected),
                ..
            } = input
            {
                connected += 1;
            }
        }
        assert_eq!(connected, 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_before_remote_description_are_refused() {
        let (a, _b, _rx) = pair().await;
        let err = a
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDescription(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rollback_returns_to_stable() {
        let (a, b, _rx) = pair().await;
        let offer_a = a.create_offer().await.unwrap();
        a.set_local_description(offer_a).await.unwrap();
        let offer_b = b.create_offer().await.unwrap();

        assert!(a.set_remote_description(offer_b.clone()).await.is_err());
        a.rollback().await.unwrap();
        a.set_remote_description(offer_b).await.unwrap();
        assert!(a.create_answer().await.is_ok());
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use meet_proto::{ConnectionId, IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use super::PeerInput;
use crate::error::ConnectionError;
use crate::media::{MediaTrack, TrackKind};

/// Transport-level state reported by the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

/// Callback sink handed to a connection when it is created. Events are
/// stamped with the session generation so a replaced session's late
/// callbacks can be told apart from the current one's.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    remote_id: ConnectionId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerInput>,
}

impl ConnectionEvents {
    pub(crate) fn new(
        remote_id: ConnectionId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerInput>,
    ) -> Self {
        Self {
            remote_id,
            generation,
            tx,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Returns false once the controller is gone.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(PeerInput::Connection {
                remote_id: self.remote_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One peer-to-peer media connection to a single remote member.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    /// Abandon an outstanding local offer. A no-op when none is outstanding.
    async fn rollback(&self) -> Result<(), ConnectionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), ConnectionError>;
    async fn replace_track(
        &self,
        old: &MediaTrack,
        new: Arc<MediaTrack>,
    ) -> Result<(), ConnectionError>;
    async fn remove_track(&self, track: &MediaTrack) -> Result<(), ConnectionError>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn connect(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError>;
}

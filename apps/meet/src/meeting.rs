//! One participant's view of a meeting: signaling, peers, local media,
//! roster, chat and notices, driven one input at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use meet_proto::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::chat::{ChatEntry, ChatLog};
use crate::config::ClientConfig;
use crate::error::{MediaError, MeetError};
use crate::media::{LocalMediaManager, MediaChange, MediaDevices, TrackKind};
use crate::notice::{Notice, NoticeKind, Notices};
use crate::peer::{CloseReason, MediaConnector, PeerController, PeerEvent, PeerInput};
use crate::presence::Presence;
use crate::signaling::{SignalingClient, TransportStatus};

#[derive(Debug, Clone)]
pub struct MeetingOptions {
    pub room: String,
    pub display_name: String,
    pub audio: bool,
    pub video: bool,
}

/// What changed during a step, for whoever renders the meeting.
#[derive(Debug, Clone, PartialEq)]
pub enum MeetingEvent {
    RosterChanged,
    MemberJoined { display_name: String },
    MemberLeft { display_name: String },
    Chat(ChatEntry),
    Peer(PeerEvent),
    Notice(Notice),
    Transport(TransportStatus),
}

/// One unit of work for [`Meeting::process`].
pub struct MeetingInput(Input);

enum Input {
    Server(ServerMessage),
    ServerClosed,
    Peer(PeerInput),
    Transport(TransportStatus),
}

pub struct Meeting {
    options: MeetingOptions,
    signaling: SignalingClient,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    inbound_open: bool,
    status: watch::Receiver<TransportStatus>,
    peers: PeerController,
    peer_inputs: mpsc::UnboundedReceiver<PeerInput>,
    media: LocalMediaManager,
    presence: Presence,
    chat: ChatLog,
    notices: Notices,
    outbox: VecDeque<MeetingEvent>,
    left: bool,
}

impl Meeting {
    /// Connect, join the room, then acquire local media. Device failures
    /// become notices; they never abort the join.
    pub async fn join(
        config: &ClientConfig,
        options: MeetingOptions,
        connector: Arc<dyn MediaConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, MeetError> {
        let (signaling, inbound) =
            SignalingClient::connect(&config.server_url, config.heartbeat_interval).await?;
        let local_id = signaling.connection_id().to_string();
        let status = signaling.status();
        let (peers, peer_inputs) = PeerController::new(
            local_id.clone(),
            connector,
            signaling.sender(),
            config.peer_config(),
        );

        let mut meeting = Self {
            presence: Presence::new(Some(local_id.clone())),
            options,
            signaling,
            inbound,
            inbound_open: true,
            status,
            peers,
            peer_inputs,
            media: LocalMediaManager::new(devices),
            chat: ChatLog::new(),
            notices: Notices::new(),
            outbox: VecDeque::new(),
            left: false,
        };

        meeting.signaling.send(ClientMessage::JoinRoom {
            room_token: meeting.options.room.clone(),
            display_name: meeting.options.display_name.clone(),
        })?;
        info!(room = %meeting.options.room, connection_id = %local_id, "joining meeting");

        let outcome = meeting
            .media
            .acquire(meeting.options.audio, meeting.options.video)
            .await;
        for err in outcome.errors {
            meeting.permission_notice(err);
        }
        meeting.apply_media_changes(outcome.changes).await;
        meeting.publish_media_status();
        Ok(meeting)
    }

    pub fn local_id(&self) -> &str {
        self.signaling.connection_id()
    }

    pub fn room(&self) -> &str {
        &self.options.room
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn media(&self) -> &LocalMediaManager {
        &self.media
    }

    pub fn peers(&self) -> &PeerController {
        &self.peers
    }

    pub fn transport(&self) -> TransportStatus {
        *self.status.borrow()
    }

    pub fn dismiss_notice(&mut self, id: u64) -> bool {
        self.notices.dismiss(id)
    }

    /// Wait for and process one input. Returns the events it produced.
    pub async fn step(&mut self) -> Vec<MeetingEvent> {
        if !self.outbox.is_empty() {
            return self.take_events();
        }
        let input = self.next_input().await;
        self.process(input).await
    }

    /// Like [`step`](Self::step) but gives up waiting after `wait`.
    /// Only the wait is bounded; a started input always completes.
    pub async fn step_for(&mut self, wait: Duration) -> Vec<MeetingEvent> {
        if !self.outbox.is_empty() {
            return self.take_events();
        }
        match tokio::time::timeout(wait, self.next_input()).await {
            Ok(input) => self.process(input).await,
            Err(_) => Vec::new(),
        }
    }

    /// Events queued by commands since the last step.
    pub fn take_events(&mut self) -> Vec<MeetingEvent> {
        self.outbox.drain(..).collect()
    }

    /// Wait for the next input. Cancel safe, so it can sit in a
    /// `select!` next to other sources; hand the result to
    /// [`process`](Self::process).
    pub async fn next_input(&mut self) -> MeetingInput {
        let input = tokio::select! {
            message = self.inbound.recv(), if self.inbound_open => match message {
                Some(message) => Input::Server(message),
                None => Input::ServerClosed,
            },
            Some(input) = self.peer_inputs.recv() => Input::Peer(input),
            Ok(()) = self.status.changed() => Input::Transport(*self.status.borrow_and_update()),
        };
        MeetingInput(input)
    }

    pub async fn process(&mut self, MeetingInput(input): MeetingInput) -> Vec<MeetingEvent> {
        match input {
            Input::Server(message) => self.handle_server_message(message).await,
            Input::ServerClosed => {
                self.inbound_open = false;
                self.transport_changed(TransportStatus::Disconnected);
            }
            Input::Peer(input) => self.peers.handle_input(input).await,
            Input::Transport(status) => self.transport_changed(status),
        }
        self.collect_peer_events();
        self.take_events()
    }

    fn transport_changed(&mut self, status: TransportStatus) {
        let had_notice = self.notices.iter().any(|n| n.kind == NoticeKind::Transport);
        self.notices.set_transport_status(status);
        if status == TransportStatus::Disconnected && !had_notice {
            warn!(room = %self.options.room, "signaling connection lost");
            if let Some(notice) = self.notices.iter().last().cloned() {
                self.outbox.push_back(MeetingEvent::Notice(notice));
            }
            self.outbox.push_back(MeetingEvent::Transport(status));
        } else if status != TransportStatus::Disconnected {
            self.outbox.push_back(MeetingEvent::Transport(status));
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match &message {
            ServerMessage::RoomUsers { .. } | ServerMessage::RoomUsersChanged { .. } => {
                if self.presence.apply(&message) {
                    self.outbox.push_back(MeetingEvent::RosterChanged);
                }
                self.mirror_own_status();
                let remote_ids = self.presence.remote_ids();
                self.peers.sync_roster(&remote_ids).await;
            }
            ServerMessage::UserMediaStatusChanged { .. } => {
                self.presence.apply(&message);
                self.outbox.push_back(MeetingEvent::RosterChanged);
            }
            ServerMessage::MemberJoined { display_name, .. } => {
                self.outbox.push_back(MeetingEvent::MemberJoined {
                    display_name: display_name.clone(),
                });
            }
            ServerMessage::MemberLeft { display_name, .. } => {
                self.outbox.push_back(MeetingEvent::MemberLeft {
                    display_name: display_name.clone(),
                });
            }
            ServerMessage::RelayMessage(_) | ServerMessage::RelayMessageConfirm(_) => {
                if self.chat.apply(&message) {
                    if let Some(entry) = self.chat.entries().last() {
                        self.outbox.push_back(MeetingEvent::Chat(entry.clone()));
                    }
                }
            }
            ServerMessage::Offer { .. }
            | ServerMessage::Answer { .. }
            | ServerMessage::Candidate { .. } => match message.signal() {
                Some(Ok((sender_id, signal))) => self.peers.handle_signal(sender_id, signal).await,
                Some(Err(err)) => warn!("malformed signal dropped: {err}"),
                None => {}
            },
            ServerMessage::Connected { .. } => {
                debug!("duplicate connected frame ignored");
            }
            ServerMessage::Pong => trace!("pong"),
        }
    }

    fn collect_peer_events(&mut self) {
        for event in self.peers.drain_events() {
            match &event {
                PeerEvent::SessionOpened { remote_id } => self.presence.ensure_peer(remote_id),
                PeerEvent::Connected { remote_id } => {
                    self.presence.set_media_connected(remote_id, true)
                }
                PeerEvent::SessionClosed { remote_id, reason } => {
                    let name = self
                        .presence
                        .get(remote_id)
                        .map(|p| p.display_name.clone())
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| remote_id.clone());
                    self.presence.prune_peer(remote_id);
                    if let CloseReason::Failed(reason) = reason {
                        let id = self.notices.push(
                            NoticeKind::Negotiation,
                            format!("Connection to {name} failed: {reason}"),
                        );
                        if let Some(notice) = self.notices.iter().find(|n| n.id == id).cloned() {
                            self.outbox.push_back(MeetingEvent::Notice(notice));
                        }
                    }
                }
                PeerEvent::RemoteTrack { .. } | PeerEvent::NegotiationTimedOut { .. } => {}
            }
            self.outbox.push_back(MeetingEvent::Peer(event));
        }
    }

    fn permission_notice(&mut self, err: MediaError) {
        let id = self.notices.push(NoticeKind::Permission, err.to_string());
        if let Some(notice) = self.notices.iter().find(|n| n.id == id).cloned() {
            self.outbox.push_back(MeetingEvent::Notice(notice));
        }
    }

    async fn apply_media_changes(&mut self, changes: Vec<MediaChange>) {
        for change in &changes {
            self.peers.apply_media_change(change).await;
        }
        self.collect_peer_events();
    }

    fn media_flags(&self) -> (bool, bool) {
        (
            self.media.audio_enabled(),
            self.media.video_enabled() || self.media.is_sharing_screen(),
        )
    }

    /// Tell the room our current intent flags and mirror them locally.
    fn publish_media_status(&mut self) {
        let (has_audio, has_video) = self.media_flags();
        let _ = self.signaling.send(ClientMessage::MediaStatusChanged {
            room_token: self.options.room.clone(),
            has_audio,
            has_video,
        });
        self.mirror_own_status();
    }

    /// The server never echoes our own status, and a roster can predate it.
    fn mirror_own_status(&mut self) {
        let (has_audio, has_video) = self.media_flags();
        self.presence.apply(&ServerMessage::UserMediaStatusChanged {
            user_id: self.local_id().to_string(),
            has_audio,
            has_video,
        });
    }

    pub fn send_chat(&mut self, text: &str) -> Result<String, MeetError> {
        let local_id = self.local_id().to_string();
        let message_id = self
            .chat
            .compose(&local_id, &self.options.display_name, text);
        self.signaling.send(ClientMessage::RelayMessage {
            room_token: self.options.room.clone(),
            text: text.to_string(),
            message_id: Some(message_id.clone()),
        })?;
        Ok(message_id)
    }

    pub async fn toggle(&mut self, kind: TrackKind) {
        match self.media.toggle(kind).await {
            Ok(changes) => self.apply_media_changes(changes).await,
            Err(err) => self.permission_notice(err),
        }
        self.publish_media_status();
    }

    pub async fn start_screen_share(&mut self) {
        match self.media.start_screen_share().await {
            Ok(changes) => self.apply_media_changes(changes).await,
            Err(err) => self.permission_notice(err),
        }
        self.publish_media_status();
    }

    pub async fn stop_screen_share(&mut self) {
        let changes = self.media.stop_screen_share();
        self.apply_media_changes(changes).await;
        self.publish_media_status();
    }

    /// Stop local media, close every peer connection and leave the room.
    pub async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.media.stop_all();
        self.peers.close_all().await;
        let _ = self.signaling.send(ClientMessage::LeaveRoom {
            room_token: self.options.room.clone(),
        });
        self.signaling.close().await;
        info!(room = %self.options.room, "left meeting");
    }
}

impl Drop for Meeting {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        self.media.stop_all();
        self.peers.close_all_detached();
        let _ = self.signaling.send(ClientMessage::LeaveRoom {
            room_token: self.options.room.clone(),
        });
        debug!(room = %self.options.room, "meeting dropped without leave; cleaned up");
    }
}

//! Presence View Model: the locally known roster, reduced from server
//! broadcasts.

use meet_proto::{ConnectionId, MemberInfo, ServerMessage};

/// Why an entry is in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    Server,
    /// Only known because a peer connection to it exists.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ConnectionId,
    pub display_name: String,
    pub has_audio: bool,
    pub has_video: bool,
    pub source: RosterSource,
    pub media_connected: bool,
}

impl Participant {
    fn from_member(member: &MemberInfo) -> Self {
        Self {
            id: member.id.clone(),
            display_name: member.display_name.clone(),
            has_audio: member.has_audio,
            has_video: member.has_video,
            source: RosterSource::Server,
            media_connected: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Presence {
    local_id: Option<ConnectionId>,
    participants: Vec<Participant>,
}

impl Presence {
    pub fn new(local_id: Option<ConnectionId>) -> Self {
        Self {
            local_id,
            participants: Vec::new(),
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Server-listed members other than ourselves.
    pub fn remote_ids(&self) -> Vec<ConnectionId> {
        self.participants
            .iter()
            .filter(|p| p.source == RosterSource::Server)
            .filter(|p| self.local_id.as_deref() != Some(p.id.as_str()))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Fold one server event in. Returns true when the member set changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::RoomUsers { users } | ServerMessage::RoomUsersChanged { users } => {
                self.replace(users)
            }
            ServerMessage::UserMediaStatusChanged {
                user_id,
                has_audio,
                has_video,
            } => {
                if let Some(participant) = self.participants.iter_mut().find(|p| p.id == *user_id) {
                    participant.has_audio = *has_audio;
                    participant.has_video = *has_video;
                }
                false
            }
            _ => false,
        }
    }

    /// Full replace of the server-sourced entries. Peer-only entries stay
    /// until their session closes.
    fn replace(&mut self, users: &[MemberInfo]) -> bool {
        let before: Vec<ConnectionId> = self.participants.iter().map(|p| p.id.clone()).collect();
        let mut next: Vec<Participant> = users
            .iter()
            .map(|member| {
                let mut participant = Participant::from_member(member);
                if let Some(existing) = self.get(&member.id) {
                    participant.media_connected = existing.media_connected;
                }
                participant
            })
            .collect();
        next.extend(
            self.participants
                .iter()
                .filter(|p| p.source == RosterSource::Peer)
                .filter(|p| !users.iter().any(|u| u.id == p.id))
                .cloned(),
        );
        self.participants = next;
        let after: Vec<&ConnectionId> = self.participants.iter().map(|p| &p.id).collect();
        before.len() != after.len() || before.iter().zip(after).any(|(a, b)| a != b)
    }

    /// Record a peer we have a session with but the server has not listed.
    pub fn ensure_peer(&mut self, id: &str) {
        if self.get(id).is_some() || self.local_id.as_deref() == Some(id) {
            return;
        }
        self.participants.push(Participant {
            id: id.to_string(),
            display_name: String::new(),
            has_audio: true,
            has_video: true,
            source: RosterSource::Peer,
            media_connected: false,
        });
    }

    pub fn set_media_connected(&mut self, id: &str, connected: bool) {
        if let Some(participant) = self.participants.iter_mut().find(|p| p.id == id) {
            participant.media_connected = connected;
        }
    }

    /// Session for `id` closed: drop its entry if only the peer put it here.
    pub fn prune_peer(&mut self, id: &str) {
        self.participants
            .retain(|p| !(p.id == id && p.source == RosterSource::Peer));
        self.set_media_connected(id, false);
    }
}

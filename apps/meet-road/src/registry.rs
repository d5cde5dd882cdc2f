use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meet_proto::{ChatMessage, ClientMessage, ConnectionId, MemberInfo, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::telemetry;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// A live socket, whether or not it has joined a room yet.
struct ConnectionEntry {
    tx: Outbound,
    room: Option<String>,
    last_heartbeat: Instant,
}

struct Member {
    display_name: String,
    has_audio: bool,
    has_video: bool,
    joined_at: DateTime<Utc>,
    tx: Outbound,
}

#[derive(Default)]
struct Room {
    members: HashMap<ConnectionId, Member>,
}

impl Room {
    fn roster(&self) -> Vec<MemberInfo> {
        let mut members: Vec<(&ConnectionId, &Member)> = self.members.iter().collect();
        members.sort_by(|(a_id, a), (b_id, b)| {
            a.joined_at.cmp(&b.joined_at).then_with(|| a_id.cmp(b_id))
        });
        members
            .into_iter()
            .map(|(id, member)| MemberInfo {
                id: id.clone(),
                display_name: member.display_name.clone(),
                has_audio: member.has_audio,
                has_video: member.has_video,
            })
            .collect()
    }

    fn broadcast(&self, message: &ServerMessage) {
        for member in self.members.values() {
            let _ = member.tx.send(message.clone());
        }
    }

    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        for (id, member) in &self.members {
            if id != sender_id {
                let _ = member.tx.send(message.clone());
            }
        }
    }
}

/// Process-wide registry of rooms and their members.
///
/// Every room mutation and the broadcast computed from it happen while the
/// room's map entry is held, so each roster broadcast is the exact member set
/// at that point. A connections guard is never held while a room is locked
/// from the other side: paths read what they need from `connections`, drop
/// the guard, then lock the room.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new socket and greet it with its connection id.
    pub fn connect(&self, tx: Outbound) -> ConnectionId {
        let connection_id = Uuid::new_v4().to_string();
        let _ = tx.send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
        });
        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                tx,
                room: None,
                last_heartbeat: Instant::now(),
            },
        );
        telemetry::connection_opened();
        connection_id
    }

    /// Same cleanup as an explicit leave, then forget the socket.
    pub fn disconnect(&self, connection_id: &str) {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return;
        };
        telemetry::connection_closed();
        if let Some(room) = entry.room {
            self.remove_member(connection_id, &room);
        }
    }

    pub fn dispatch(&self, connection_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom {
                room_token,
                display_name,
            } => self.join(connection_id, &room_token, display_name),
            ClientMessage::LeaveRoom { room_token } => self.leave(connection_id, &room_token),
            ClientMessage::RelayMessage {
                room_token,
                text,
                message_id,
            } => self.relay_chat(connection_id, &room_token, text, message_id),
            ClientMessage::Offer { target_id, payload } => {
                self.relay_signal(connection_id, &target_id, payload, |sender_id, payload| {
                    ServerMessage::Offer { sender_id, payload }
                })
            }
            ClientMessage::Answer { target_id, payload } => {
                self.relay_signal(connection_id, &target_id, payload, |sender_id, payload| {
                    ServerMessage::Answer { sender_id, payload }
                })
            }
            ClientMessage::Candidate { target_id, payload } => {
                self.relay_signal(connection_id, &target_id, payload, |sender_id, payload| {
                    ServerMessage::Candidate { sender_id, payload }
                })
            }
            ClientMessage::MediaStatusChanged {
                room_token,
                has_audio,
                has_video,
            } => self.update_media_status(connection_id, &room_token, has_audio, has_video),
            ClientMessage::Ping => self.heartbeat(connection_id),
        }
    }

    pub fn join(&self, connection_id: &str, room_token: &str, display_name: String) {
        let (tx, previous_room) = match self.connections.get(connection_id) {
            Some(entry) => (entry.tx.clone(), entry.room.clone()),
            None => {
                debug!(connection_id, "join from unknown connection ignored");
                return;
            }
        };
        if let Some(previous) = previous_room.as_deref() {
            if previous != room_token {
                self.leave(connection_id, previous);
            }
        }

        {
            let mut room = self.rooms.entry(room_token.to_string()).or_default();
            let existing = room.members.get(connection_id).map(|member| {
                (member.has_audio, member.has_video, member.joined_at)
            });
            let (has_audio, has_video, joined_at) =
                existing.unwrap_or((true, true, Utc::now()));
            if existing.is_none() {
                room.broadcast(&ServerMessage::MemberJoined {
                    id: connection_id.to_string(),
                    display_name: display_name.clone(),
                });
            }
            room.members.insert(
                connection_id.to_string(),
                Member {
                    display_name,
                    has_audio,
                    has_video,
                    joined_at,
                    tx: tx.clone(),
                },
            );
            let users = room.roster();
            info!(
                room = room_token,
                connection_id,
                members = users.len(),
                rejoin = existing.is_some(),
                "member joined room"
            );
            let _ = tx.send(ServerMessage::RoomUsers {
                users: users.clone(),
            });
            room.broadcast(&ServerMessage::RoomUsersChanged { users });
        }

        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.room = Some(room_token.to_string());
        }
        telemetry::set_room_count(self.rooms.len());
    }

    pub fn leave(&self, connection_id: &str, room_token: &str) {
        self.remove_member(connection_id, room_token);
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            if entry.room.as_deref() == Some(room_token) {
                entry.room = None;
            }
        }
    }

    fn remove_member(&self, connection_id: &str, room_token: &str) {
        let now_empty = {
            let Some(mut room) = self.rooms.get_mut(room_token) else {
                debug!(room = room_token, connection_id, "leave for unknown room ignored");
                return;
            };
            let Some(member) = room.members.remove(connection_id) else {
                return;
            };
            info!(
                room = room_token,
                connection_id,
                members = room.members.len(),
                "member left room"
            );
            if !room.members.is_empty() {
                room.broadcast(&ServerMessage::MemberLeft {
                    id: connection_id.to_string(),
                    display_name: member.display_name,
                });
                room.broadcast(&ServerMessage::RoomUsersChanged {
                    users: room.roster(),
                });
            }
            room.members.is_empty()
        };

        // A join may have landed between the guard drop and here.
        if now_empty
            && self
                .rooms
                .remove_if(room_token, |_, room| room.members.is_empty())
                .is_some()
        {
            debug!(room = room_token, "room emptied and removed");
        }
        telemetry::set_room_count(self.rooms.len());
    }

    pub fn relay_chat(
        &self,
        connection_id: &str,
        room_token: &str,
        text: String,
        message_id: Option<String>,
    ) {
        let Some(room) = self.rooms.get(room_token) else {
            debug!(room = room_token, connection_id, "chat for unknown room dropped");
            return;
        };
        let Some(sender) = room.members.get(connection_id) else {
            debug!(room = room_token, connection_id, "chat before join dropped");
            return;
        };
        let message = ChatMessage {
            id: connection_id.to_string(),
            display_name: sender.display_name.clone(),
            text,
            message_id,
        };
        let _ = sender
            .tx
            .send(ServerMessage::RelayMessageConfirm(message.clone()));
        room.broadcast_except(connection_id, &ServerMessage::RelayMessage(message));
        telemetry::chat_relayed();
    }

    /// Forward an opaque signaling payload to one connection.
    pub fn relay_signal<F>(&self, connection_id: &str, target_id: &str, payload: Value, build: F)
    where
        F: FnOnce(ConnectionId, Value) -> ServerMessage,
    {
        match self.connections.get(target_id) {
            Some(target) => {
                let _ = target.tx.send(build(connection_id.to_string(), payload));
                telemetry::signal_relayed();
            }
            None => {
                debug!(connection_id, target_id, "signal for vanished target dropped");
            }
        }
    }

    pub fn update_media_status(
        &self,
        connection_id: &str,
        room_token: &str,
        has_audio: bool,
        has_video: bool,
    ) {
        let Some(mut room) = self.rooms.get_mut(room_token) else {
            return;
        };
        let Some(member) = room.members.get_mut(connection_id) else {
            debug!(room = room_token, connection_id, "media status before join dropped");
            return;
        };
        member.has_audio = has_audio;
        member.has_video = has_video;
        room.broadcast_except(
            connection_id,
            &ServerMessage::UserMediaStatusChanged {
                user_id: connection_id.to_string(),
                has_audio,
                has_video,
            },
        );
    }

    pub fn heartbeat(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.last_heartbeat = Instant::now();
            let _ = entry.tx.send(ServerMessage::Pong);
        }
    }

    /// Disconnect every connection silent for longer than `timeout`.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.last_heartbeat.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in &stale {
            info!(connection_id = %connection_id, "removing stale connection (heartbeat timeout)");
            self.disconnect(connection_id);
        }
        stale
    }

    pub fn roster(&self, room_token: &str) -> Vec<MemberInfo> {
        self.rooms
            .get(room_token)
            .map(|room| room.roster())
            .unwrap_or_default()
    }

    pub fn contains_room(&self, room_token: &str) -> bool {
        self.rooms.contains_key(room_token)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

pub fn spawn_heartbeat_monitor(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_stale(timeout);
            if !reaped.is_empty() {
                debug!(count = reaped.len(), "heartbeat sweep removed connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestConn {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestConn {
        fn open(registry: &RoomRegistry) -> Self {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let id = registry.connect(tx);
            assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connected { .. })));
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn last_roster(&mut self) -> Option<Vec<ConnectionId>> {
            self.drain().into_iter().rev().find_map(|message| match message {
                ServerMessage::RoomUsersChanged { users } => {
                    let mut ids: Vec<_> = users.into_iter().map(|u| u.id).collect();
                    ids.sort();
                    Some(ids)
                }
                _ => None,
            })
        }
    }

    fn sorted(ids: &[&ConnectionId]) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = ids.iter().map(|id| (*id).clone()).collect();
        ids.sort();
        ids
    }

    #[test_timeout::timeout]
    fn join_sends_roster_then_broadcast() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        registry.join(&a.id, "room", "Ada".into());

        let messages = a.drain();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(matches!(&messages[0], ServerMessage::RoomUsers { users } if users.len() == 1));
        assert!(
            matches!(&messages[1], ServerMessage::RoomUsersChanged { users } if users[0].display_name == "Ada")
        );
    }

    #[test_timeout::timeout]
    fn existing_members_get_join_notice() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "room", "Ada".into());
        a.drain();
        registry.join(&b.id, "room", "Bob".into());

        let seen = a.drain();
        assert!(seen.iter().any(|m| matches!(
            m,
            ServerMessage::MemberJoined { id, display_name } if *id == b.id && display_name == "Bob"
        )));
        let joiner = b.drain();
        assert!(!joiner
            .iter()
            .any(|m| matches!(m, ServerMessage::MemberJoined { .. })));
        assert_eq!(registry.roster("room").len(), 2);
    }

    #[test_timeout::timeout]
    fn rejoin_is_idempotent_and_renames() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "room", "Ada".into());
        registry.join(&b.id, "room", "Bob".into());
        a.drain();
        registry.join(&b.id, "room", "Robert".into());

        let roster = registry.roster("room");
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().any(|m| m.display_name == "Robert"));
        assert!(!a
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::MemberJoined { .. })));
        b.drain();
    }

    #[test_timeout::timeout]
    fn roster_tracks_every_join_and_leave() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        let mut c = TestConn::open(&registry);

        registry.join(&a.id, "room", "A".into());
        assert_eq!(a.last_roster().unwrap(), sorted(&[&a.id]));
        registry.join(&b.id, "room", "B".into());
        assert_eq!(a.last_roster().unwrap(), sorted(&[&a.id, &b.id]));
        registry.join(&c.id, "room", "C".into());
        assert_eq!(b.last_roster().unwrap(), sorted(&[&a.id, &b.id, &c.id]));
        registry.leave(&b.id, "room");
        assert_eq!(a.last_roster().unwrap(), sorted(&[&a.id, &c.id]));
        registry.disconnect(&a.id);
        assert_eq!(c.last_roster().unwrap(), sorted(&[&c.id]));
        registry.leave(&c.id, "room");
        assert!(!registry.contains_room("room"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test_timeout::timeout]
    fn leave_notifies_remaining_members() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let b = TestConn::open(&registry);
        registry.join(&a.id, "room", "A".into());
        registry.join(&b.id, "room", "B".into());
        a.drain();
        registry.disconnect(&b.id);

        let seen = a.drain();
        assert!(matches!(
            &seen[0],
            ServerMessage::MemberLeft { id, display_name } if *id == b.id && display_name == "B"
        ));
        assert!(matches!(&seen[1], ServerMessage::RoomUsersChanged { users } if users.len() == 1));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test_timeout::timeout]
    fn disconnect_leaves_other_rooms_alone() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "one", "A".into());
        registry.join(&b.id, "two", "B".into());
        a.drain();
        b.drain();

        registry.disconnect(&a.id);
        assert!(!registry.contains_room("one"));
        assert!(registry.contains_room("two"));
        assert!(b.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn joining_another_room_leaves_the_first() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "one", "A".into());
        registry.join(&b.id, "one", "B".into());
        b.drain();
        registry.join(&a.id, "two", "A".into());

        assert_eq!(b.last_roster().unwrap(), sorted(&[&b.id]));
        assert_eq!(registry.roster("two").len(), 1);
        a.drain();
    }

    #[test_timeout::timeout]
    fn chat_reaches_peers_once_and_confirms_to_sender() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "room", "A".into());
        registry.join(&b.id, "room", "B".into());
        a.drain();
        b.drain();

        let long = "x".repeat(64 * 1024);
        for text in ["", "hello", long.as_str()] {
            registry.relay_chat(&a.id, "room", text.to_string(), Some("m".into()));
            let to_a = a.drain();
            let to_b = b.drain();
            assert_eq!(to_a.len(), 1);
            assert_eq!(to_b.len(), 1);
            assert!(matches!(&to_a[0], ServerMessage::RelayMessageConfirm(m) if m.text == text));
            assert!(
                matches!(&to_b[0], ServerMessage::RelayMessage(m) if m.text == text && m.id == a.id)
            );
        }
    }

    #[test_timeout::timeout]
    fn chat_before_join_is_dropped() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&b.id, "room", "B".into());
        b.drain();

        registry.relay_chat(&a.id, "room", "early".into(), None);
        registry.relay_chat(&a.id, "nowhere", "early".into(), None);
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn signals_reach_only_the_target() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        let mut c = TestConn::open(&registry);

        registry.dispatch(
            &a.id,
            ClientMessage::Offer {
                target_id: b.id.clone(),
                payload: json!({ "anything": [1, 2, 3] }),
            },
        );
        let to_b = b.drain();
        assert_eq!(
            to_b,
            vec![ServerMessage::Offer {
                sender_id: a.id.clone(),
                payload: json!({ "anything": [1, 2, 3] }),
            }]
        );
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn signal_to_missing_target_is_silent() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        registry.dispatch(
            &a.id,
            ClientMessage::Candidate {
                target_id: "gone".into(),
                payload: json!({}),
            },
        );
        assert!(a.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn media_status_patches_member_and_notifies_others() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "room", "A".into());
        registry.join(&b.id, "room", "B".into());
        a.drain();
        b.drain();

        registry.update_media_status(&a.id, "room", false, true);
        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![ServerMessage::UserMediaStatusChanged {
                user_id: a.id.clone(),
                has_audio: false,
                has_video: true,
            }]
        );
        let me = registry
            .roster("room")
            .into_iter()
            .find(|m| m.id == a.id)
            .unwrap();
        assert!(!me.has_audio);

        // Flags survive a re-join.
        registry.join(&a.id, "room", "A".into());
        let me = registry
            .roster("room")
            .into_iter()
            .find(|m| m.id == a.id)
            .unwrap();
        assert!(!me.has_audio);
    }

    #[test_timeout::timeout]
    fn ping_is_answered() {
        let registry = RoomRegistry::new();
        let mut a = TestConn::open(&registry);
        registry.dispatch(&a.id, ClientMessage::Ping);
        assert_eq!(a.drain(), vec![ServerMessage::Pong]);
    }

    #[test_timeout::timeout]
    fn reaper_removes_silent_connections() {
        let registry = RoomRegistry::new();
        let a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);
        registry.join(&a.id, "room", "A".into());
        registry.join(&b.id, "room", "B".into());
        b.drain();

        std::thread::sleep(Duration::from_millis(20));
        registry.heartbeat(&b.id);
        let reaped = registry.reap_stale(Duration::from_millis(10));
        assert_eq!(reaped, vec![a.id.clone()]);
        assert_eq!(b.last_roster().unwrap(), sorted(&[&b.id]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_joins_converge() {
        let registry = Arc::new(RoomRegistry::new());
        let mut a = TestConn::open(&registry);
        let mut b = TestConn::open(&registry);

        let (ra, rb) = (registry.clone(), registry.clone());
        let (ida, idb) = (a.id.clone(), b.id.clone());
        let ta = tokio::spawn(async move { ra.join(&ida, "room", "A".into()) });
        let tb = tokio::spawn(async move { rb.join(&idb, "room", "B".into()) });
        ta.await.unwrap();
        tb.await.unwrap();

        let expected = sorted(&[&a.id, &b.id]);
        assert_eq!(a.last_roster().unwrap(), expected);
        assert_eq!(b.last_roster().unwrap(), expected);
    }
}

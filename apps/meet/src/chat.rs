use std::collections::HashSet;

use meet_proto::{ChatMessage, ConnectionId, ServerMessage};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Shown optimistically, not yet echoed back by the server.
    Pending,
    Confirmed,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub sender_id: ConnectionId,
    pub display_name: String,
    pub text: String,
    pub message_id: Option<String>,
    pub delivery: Delivery,
}

/// In-memory chat transcript for one meeting.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    seen: HashSet<(ConnectionId, String)>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Append an optimistic local entry and return its message id.
    pub fn compose(&mut self, local_id: &str, display_name: &str, text: &str) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.seen
            .insert((local_id.to_string(), message_id.clone()));
        self.entries.push(ChatEntry {
            sender_id: local_id.to_string(),
            display_name: display_name.to_string(),
            text: text.to_string(),
            message_id: Some(message_id.clone()),
            delivery: Delivery::Pending,
        });
        message_id
    }

    /// Returns true when the transcript changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::RelayMessageConfirm(chat) => self.confirm(chat),
            ServerMessage::RelayMessage(chat) => self.receive(chat),
            _ => false,
        }
    }

    fn confirm(&mut self, chat: &ChatMessage) -> bool {
        if let Some(message_id) = &chat.message_id {
            let pending = self.entries.iter_mut().find(|entry| {
                entry.delivery == Delivery::Pending
                    && entry.message_id.as_deref() == Some(message_id.as_str())
            });
            if let Some(entry) = pending {
                entry.delivery = Delivery::Confirmed;
                entry.sender_id = chat.id.clone();
                entry.display_name = chat.display_name.clone();
                return true;
            }
        }
        self.append(chat, Delivery::Confirmed)
    }

    fn receive(&mut self, chat: &ChatMessage) -> bool {
        self.append(chat, Delivery::Received)
    }

    fn append(&mut self, chat: &ChatMessage, delivery: Delivery) -> bool {
        if let Some(message_id) = &chat.message_id {
            if !self.seen.insert((chat.id.clone(), message_id.clone())) {
                return false;
            }
        }
        self.entries.push(ChatEntry {
            sender_id: chat.id.clone(),
            display_name: chat.display_name.clone(),
            text: chat.text.clone(),
            message_id: chat.message_id.clone(),
            delivery,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str, text: &str, message_id: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            display_name: id.to_uppercase(),
            text: text.into(),
            message_id: message_id.map(Into::into),
        }
    }

    #[test_timeout::timeout]
    fn confirmation_upgrades_the_optimistic_entry() {
        let mut log = ChatLog::new();
        let message_id = log.compose("me", "Me", "hello");
        assert_eq!(log.entries()[0].delivery, Delivery::Pending);

        assert!(log.apply(&ServerMessage::RelayMessageConfirm(chat(
            "me",
            "hello",
            Some(&message_id)
        ))));
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].delivery, Delivery::Confirmed);

        assert!(!log.apply(&ServerMessage::RelayMessageConfirm(chat(
            "me",
            "hello",
            Some(&message_id)
        ))));
        assert_eq!(log.entries().len(), 1);
    }

    #[test_timeout::timeout]
    fn broadcast_copies_are_appended_once() {
        let mut log = ChatLog::new();
        let frame = ServerMessage::RelayMessage(chat("a", "hi", Some("m-1")));
        assert!(log.apply(&frame));
        assert!(!log.apply(&frame));
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].delivery, Delivery::Received);
    }

    #[test_timeout::timeout]
    fn same_message_id_from_different_senders_is_kept() {
        let mut log = ChatLog::new();
        log.apply(&ServerMessage::RelayMessage(chat("a", "x", Some("m-1"))));
        log.apply(&ServerMessage::RelayMessage(chat("b", "y", Some("m-1"))));
        assert_eq!(log.entries().len(), 2);
    }

    #[test_timeout::timeout]
    fn messages_without_ids_and_empty_text_are_kept() {
        let mut log = ChatLog::new();
        log.apply(&ServerMessage::RelayMessage(chat("a", "", None)));
        log.apply(&ServerMessage::RelayMessage(chat("a", "", None)));
        let long = "x".repeat(64 * 1024);
        log.apply(&ServerMessage::RelayMessage(chat("a", &long, None)));
        assert_eq!(log.entries().len(), 3);
        assert_eq!(log.entries()[2].text.len(), long.len());
    }
}

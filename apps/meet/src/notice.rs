use crate::signaling::TransportStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Permission,
    Negotiation,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub text: String,
    pub dismissible: bool,
}

/// User-facing warnings. Permission and negotiation problems are
/// dismissible; a lost signaling connection stays until it recovers or
/// the meeting ends.
#[derive(Debug, Default)]
pub struct Notices {
    next_id: u64,
    items: Vec<Notice>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notice> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, kind: NoticeKind, text: impl Into<String>) -> u64 {
        self.insert(kind, text.into(), true)
    }

    fn insert(&mut self, kind: NoticeKind, text: String, dismissible: bool) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.items.push(Notice {
            id,
            kind,
            text,
            dismissible,
        });
        id
    }

    /// Returns false for unknown ids and persistent notices.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| !(n.id == id && n.dismissible));
        self.items.len() != before
    }

    pub fn set_transport_status(&mut self, status: TransportStatus) {
        self.items.retain(|n| n.kind != NoticeKind::Transport);
        if status == TransportStatus::Disconnected {
            self.insert(
                NoticeKind::Transport,
                "Disconnected from the meeting server".into(),
                false,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dismiss_removes_only_that_notice() {
        let mut notices = Notices::new();
        let first = notices.push(NoticeKind::Permission, "camera permission denied");
        let second = notices.push(NoticeKind::Negotiation, "connection to Bob failed");
        assert!(notices.dismiss(first));
        assert!(!notices.dismiss(first));
        assert_eq!(notices.iter().map(|n| n.id).collect::<Vec<_>>(), vec![second]);
    }

    #[test_timeout::timeout]
    fn transport_notice_is_persistent() {
        let mut notices = Notices::new();
        notices.set_transport_status(TransportStatus::Disconnected);
        let id = notices.iter().next().unwrap().id;
        assert!(!notices.dismiss(id));
        assert_eq!(notices.len(), 1);

        notices.set_transport_status(TransportStatus::Connected);
        assert!(notices.is_empty());
    }
}

//! Client side of a meet room: signaling, a full mesh of peer
//! connections, local media, roster and chat.

pub mod chat;
pub mod config;
pub mod error;
pub mod media;
pub mod meeting;
pub mod notice;
pub mod peer;
pub mod presence;
pub mod signaling;

pub use config::ClientConfig;
pub use error::{ConnectionError, MediaError, MeetError};
pub use meeting::{Meeting, MeetingEvent, MeetingInput, MeetingOptions};

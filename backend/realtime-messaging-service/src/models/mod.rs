pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::{Conversation, ConversationKind, Participant, ParticipantRole};
pub use message::{
    Attachment, Dimensions, Message, MessageKind, MessageStatus, NewMessage, Reaction, Receipt,
    WriteBehindEntry,
};
pub use presence::{PresenceEntry, PresenceStatus};

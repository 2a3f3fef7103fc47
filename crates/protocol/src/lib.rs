pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::EventName;
pub use envelope::Envelope;
pub use messages::{
    AckPayload, ConnectionStatePayload, MessageDeltaPayload, MessageRecvPayload,
    MessageSendPayload, PresencePayload,
};

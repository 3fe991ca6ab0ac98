pub mod ids;
pub mod protocol;
pub mod security;

pub use ids::{MemberId, PartyId};
pub use protocol::{Frame, MessageType, Payload, ProtocolError, TypedMessage};

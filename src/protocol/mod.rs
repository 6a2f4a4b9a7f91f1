pub mod inbound;
pub mod outbound;

pub use inbound::{decode, ChatFrame, InboundFrame, ViolationNotice};
pub use outbound::{OutboundCommand, TypingLimiter};

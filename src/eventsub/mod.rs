//! EventSub over WebSocket: the transport session bound to the shared
//! conduit.

pub mod messages;
pub mod session;

pub use messages::{ServerMessage, Session, parse_frame};
pub use session::EventSubSession;

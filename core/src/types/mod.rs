pub mod protocol;

pub use protocol::{ChangeRecord, Frame, Message, Push, Token, HANDSHAKE_TOKEN};

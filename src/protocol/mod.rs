//! Wire protocol shared by the remote and local transports

pub mod events;
pub mod frame;
pub mod message;

pub use events::{AdminEvent, ClientType, GeEvent};
pub use frame::{LocalFrame, RemoteFrame};
pub use message::{Message, MessageError, GAME_ENGINE};

mod handshake;
pub mod message_handler;
pub mod message_id;
pub mod protocol_engine;
mod sweep;

pub use message_handler::MessageHandler;
pub use protocol_engine::{Delivery, ProtocolEngine};

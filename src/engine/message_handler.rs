use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::codec::FieldMap;

/// Application callback for received messages. `message_id` is `Some` for messages that
///  arrived through a reliable handshake; such a message is delivered exactly once even if
///  its SYN is received several times.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, message_id: Option<u32>, fields: FieldMap);
}

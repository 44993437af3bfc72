use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::codec::FieldMap;
use crate::engine::MessageHandler;

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub from: SocketAddr,
    pub message_id: Option<u32>,
    pub fields: FieldMap,
}

/// A [MessageHandler] that keeps everything it receives, for later inspection
#[derive(Debug, Default)]
pub struct CollectingHandler {
    messages: RwLock<Vec<ReceivedMessage>>,
}

impl CollectingHandler {
    pub fn new() -> CollectingHandler {
        CollectingHandler::default()
    }

    pub async fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.read().await.clone()
    }

    pub async fn num_messages(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn on_message(&self, from: SocketAddr, message_id: Option<u32>, fields: FieldMap) {
        self.messages.write().await
            .push(ReceivedMessage { from, message_id, fields });
    }
}

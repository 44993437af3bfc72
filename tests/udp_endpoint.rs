use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::Level;

use rdgram::codec::{FieldMap, FieldValues};
use rdgram::config::EngineConfig;
use rdgram::engine::Delivery;
use rdgram::test_util::collecting_handler::CollectingHandler;
use rdgram::transport::UdpEndpoint;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

async fn endpoint() -> (Arc<UdpEndpoint>, Arc<CollectingHandler>) {
    let config = EngineConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)));
    let handler = Arc::new(CollectingHandler::new());
    let endpoint = UdpEndpoint::bind(Arc::new(config), handler.clone()).await.unwrap();

    let recv_endpoint = endpoint.clone();
    tokio::spawn(async move { recv_endpoint.recv_loop().await });
    (endpoint, handler)
}

async fn wait_for_messages(handler: &CollectingHandler, expected: usize) {
    for _ in 0..100 {
        if handler.num_messages().await >= expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reliable_and_unreliable_over_localhost() {
    init_logging();

    let (a, _) = endpoint().await;
    let (b, b_handler) = endpoint().await;
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    let reliable = FieldMap::new()
        .with(FieldValues::Chars("reliable".to_string()))
        .with(FieldValues::Floats(vec![1.5, -2.25]));
    let unreliable = FieldMap::new()
        .with(FieldValues::Booleans(vec![true, false, true]))
        .with(FieldValues::Shorts((0..100).collect()));

    let message_id = a.engine().send(b_addr, &reliable, Delivery::Reliable).await.unwrap();
    assert!(message_id.is_some());
    // the SYN must not be overtaken by the later frame, or its timestamp would be stale
    wait_for_messages(&b_handler, 1).await;

    assert_eq!(a.engine().send(b_addr, &unreliable, Delivery::Unreliable).await.unwrap(), None);
    wait_for_messages(&b_handler, 2).await;

    let messages = b_handler.messages().await;
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.from == a_addr));
    assert!(messages.iter().any(|m| m.message_id == message_id && m.fields == reliable));
    assert!(messages.iter().any(|m| m.message_id.is_none() && m.fields == unreliable));

    // give the handshake time to complete on both sides
    for _ in 0..100 {
        if a.engine().active_connection_count().await == 0 && b.engine().active_connection_count().await == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(a.engine().active_connection_count().await, 0);
    assert_eq!(b.engine().active_connection_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_bind_rejects_invalid_config() {
    let mut config = EngineConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)));
    config.worker_count = 0;
    assert!(UdpEndpoint::bind(Arc::new(config), Arc::new(CollectingHandler::new())).await.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_socket() {
    init_logging();

    let config = EngineConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)));
    let endpoint = UdpEndpoint::bind(Arc::new(config), Arc::new(CollectingHandler::new())).await.unwrap();
    let addr = endpoint.local_addr().unwrap();
    let recv_endpoint = endpoint.clone();
    let recv_loop = tokio::spawn(async move { recv_endpoint.recv_loop().await });

    endpoint.shutdown().await;
    recv_loop.await.unwrap();

    assert!(endpoint.local_addr().is_err());
    assert!(endpoint.engine().send(addr, &FieldMap::new(), Delivery::Unreliable).await.is_err());

    // the port is free again while the endpoint and its engine are still alive
    let rebound = UdpSocket::bind(addr).await.unwrap();
    assert_eq!(rebound.local_addr().unwrap(), addr);
}

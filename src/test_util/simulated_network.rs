use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::codec::{FrameFlags, FrameKind};
use crate::engine::ProtocolEngine;
use crate::transport::datagram_socket::DatagramSocket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub buf: Bytes,
}

impl SimDatagram {
    /// the frame kind according to the flags byte, without validating the rest of the frame
    pub fn kind(&self) -> Option<FrameKind> {
        self.buf.first()
            .and_then(|&flags| FrameKind::from_flags(FrameFlags::from_bits_truncate(flags)))
    }
}

type DropFilter = Box<dyn Fn(&SimDatagram) -> bool + Send + Sync>;

/// An in-memory network connecting [ProtocolEngine]s. Sent datagrams are queued until
///  [SimulatedNetwork::deliver_all] is called, which makes tests deterministic regardless of
///  worker scheduling. Datagrams can be dropped selectively to simulate packet loss.
#[derive(Default)]
pub struct SimulatedNetwork {
    engines: RwLock<FxHashMap<SocketAddr, Weak<ProtocolEngine>>>,
    in_flight: Mutex<VecDeque<SimDatagram>>,
    sent: RwLock<Vec<SimDatagram>>,
    drop_filter: RwLock<Option<DropFilter>>,
    num_dropped: AtomicUsize,
}

impl SimulatedNetwork {
    pub fn new() -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork::default())
    }

    /// a socket sending into this network from `addr`
    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimSocket> {
        Arc::new(SimSocket {
            addr,
            network: self.clone(),
        })
    }

    pub async fn register(&self, addr: SocketAddr, engine: &Arc<ProtocolEngine>) {
        self.engines.write().await
            .insert(addr, Arc::downgrade(engine));
    }

    /// Datagrams for which the filter returns `true` are dropped when they are sent
    pub async fn set_drop_filter(&self, filter: impl Fn(&SimDatagram) -> bool + Send + Sync + 'static) {
        *self.drop_filter.write().await = Some(Box::new(filter));
    }

    pub async fn clear_drop_filter(&self) {
        *self.drop_filter.write().await = None;
    }

    /// Queues raw bytes for delivery, bypassing the drop filter and the log of sent datagrams
    pub async fn inject(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        self.in_flight.lock().await
            .push_back(SimDatagram { from, to, buf: Bytes::copy_from_slice(buf) });
    }

    async fn on_sent(&self, datagram: SimDatagram) {
        trace!("simulated network: {:?} -> {:?}: {:?}", datagram.from, datagram.to, datagram.kind());
        self.sent.write().await.push(datagram.clone());

        let is_dropped = self.drop_filter.read().await
            .as_ref()
            .is_some_and(|filter| filter(&datagram));
        if is_dropped {
            trace!("simulated network: dropping datagram");
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
            return;
        }
        self.in_flight.lock().await.push_back(datagram);
    }

    /// Delivers queued datagrams, including those sent in response, until the network is
    ///  quiet. Returns the number of delivered datagrams.
    pub async fn deliver_all(&self) -> usize {
        let mut num_delivered = 0;
        loop {
            let next = self.in_flight.lock().await.pop_front();
            let Some(datagram) = next else {
                return num_delivered;
            };

            let engine = self.engines.read().await
                .get(&datagram.to)
                .and_then(Weak::upgrade);
            match engine {
                Some(engine) => {
                    engine.on_datagram(datagram.from, &datagram.buf).await;
                    num_delivered += 1;
                }
                None => trace!("simulated network: no engine at {:?} - discarding", datagram.to),
            }
        }
    }

    pub async fn sent_datagrams(&self) -> Vec<SimDatagram> {
        self.sent.read().await.clone()
    }

    pub async fn count_sent(&self, kind: FrameKind) -> usize {
        self.sent.read().await
            .iter()
            .filter(|d| d.kind() == Some(kind))
            .count()
    }

    pub async fn num_in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::Acquire)
    }
}

pub struct SimSocket {
    addr: SocketAddr,
    network: Arc<SimulatedNetwork>,
}

#[async_trait]
impl DatagramSocket for SimSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()> {
        self.network.on_sent(SimDatagram {
            from: self.addr,
            to,
            buf: Bytes::copy_from_slice(buf),
        }).await;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

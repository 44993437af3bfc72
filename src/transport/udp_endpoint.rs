use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::config::EngineConfig;
use crate::engine::{MessageHandler, ProtocolEngine};
use crate::transport::datagram_socket::DatagramSocket;

/// The endpoint's UDP socket, shared with the engine for sending. Closing it releases the
///  socket even if the engine is still referenced elsewhere; sending fails after that.
struct ClosableSocket {
    inner: RwLock<Option<Arc<UdpSocket>>>,
}

impl ClosableSocket {
    fn get(&self) -> io::Result<Arc<UdpSocket>> {
        self.inner.read()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "socket lock is poisoned"))?
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is closed"))
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.take();
        }
    }
}

#[async_trait]
impl DatagramSocket for ClosableSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()> {
        let socket = self.get()?;
        DatagramSocket::send_to(socket.as_ref(), to, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get()?.local_addr()
    }
}

/// Binds a [ProtocolEngine] to a real UDP socket: incoming datagrams are read in a receive
///  loop and handed to the engine's worker pool, and the engine sends through the same socket.
pub struct UdpEndpoint {
    socket: Arc<ClosableSocket>,
    engine: Arc<ProtocolEngine>,
    config: Arc<EngineConfig>,
    shutdown_notify: Notify,
}

impl UdpEndpoint {
    pub async fn bind(config: Arc<EngineConfig>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<Arc<UdpEndpoint>> {
        config.validate()?;

        let udp_socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound UDP socket to {:?}", udp_socket.local_addr()?);
        let socket = Arc::new(ClosableSocket {
            inner: RwLock::new(Some(Arc::new(udp_socket))),
        });

        let engine = ProtocolEngine::new(config.clone(), socket.clone(), handler)?;
        engine.start()?;

        Ok(Arc::new(UdpEndpoint {
            socket,
            engine,
            config,
            shutdown_notify: Notify::new(),
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Runs until [UdpEndpoint::shutdown] is called
    pub async fn recv_loop(&self) {
        let socket = match self.socket.get() {
            Ok(socket) => socket,
            Err(e) => {
                info!("not starting receive loop: {}", e);
                return;
            }
        };
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = select! {
                _ = self.shutdown_notify.notified() => {
                    info!("receive loop terminating");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    }
                }
            };

            trace!("received {} bytes from {:?}", num_read, from);
            if let Err(e) = self.engine.dispatch_datagram(from, Bytes::copy_from_slice(&buf[..num_read])) {
                debug!("could not dispatch datagram from {:?}: {}", from, e);
            }
        }
    }

    /// Stops the receive loop and the engine, and closes the socket. The OS level socket is
    ///  released as soon as the receive loop has returned. Work that is in progress is allowed
    ///  to finish, but it cannot send anymore.
    pub async fn shutdown(&self) {
        self.shutdown_notify.notify_one();
        self.engine.shutdown().await;
        self.socket.close();
        info!("closed UDP socket");
    }
}

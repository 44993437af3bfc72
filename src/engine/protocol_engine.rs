use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::codec::frame::WRAPAROUND_TIMESTAMP;
use crate::codec::{decode, encode, DecodeError, FieldMap, FrameFlags, FrameKind, FrameOptions};
use crate::config::EngineConfig;
use crate::engine::message_handler::MessageHandler;
use crate::engine::message_id::MessageIdAllocator;
use crate::executor::scheduler::{Scheduler, TaskFactory};
use crate::executor::worker_pool::{Task, WorkerPool};
use crate::store::connection_record::{ConnectionKey, ConnectionRecord, HandshakeStatus, Role};
use crate::store::{ExpiringRecord, Record, RecordStore};
use crate::transport::datagram_socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// fire and forget, subject to timestamp based replay rejection at the receiver
    Unreliable,
    /// at-least-once transport with exactly-once delivery to the receiving application
    Reliable,
}

/// ProtocolEngine is where the parts of the protocol come together: it decodes incoming
///  datagrams and runs the handshake state machine on them, and it has an API for application
///  code to send messages.
///
/// It owns the worker pool that processes datagrams, the scheduler driving timeouts, and the
///  store holding all per-peer and per-handshake state.
pub struct ProtocolEngine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) socket: Arc<dyn DatagramSocket>,
    pub(super) handler: Arc<dyn MessageHandler>,
    pub(super) store: RecordStore,
    pool: Arc<WorkerPool>,
    scheduler: Scheduler,
    message_ids: MessageIdAllocator,
}

impl ProtocolEngine {
    /// NB: This spawns the engine's worker and timer tasks, so it must be called in the context
    ///  of a tokio runtime
    pub fn new(config: Arc<EngineConfig>, socket: Arc<dyn DatagramSocket>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<Arc<ProtocolEngine>> {
        config.validate()?;

        let pool = WorkerPool::new(config.worker_count);
        let scheduler = Scheduler::new(config.scheduler_tick, Some(pool.clone()));

        Ok(Arc::new(ProtocolEngine {
            store: RecordStore::new(config.clone()),
            config,
            socket,
            handler,
            pool,
            scheduler,
            message_ids: MessageIdAllocator::new(),
        }))
    }

    /// Starts the periodic timeout and deletion sweeps. The engine processes datagrams without
    ///  this, but it never retransmits or cleans up.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!("starting protocol engine on {:?}", self.socket.local_addr()?);

        self.scheduler.schedule_after(
            Self::sweep_factory(Arc::downgrade(self), |engine| async move { engine.run_timeout_sweep().await }),
            self.config.timeout_sweep_interval,
            true,
        )?;
        self.scheduler.schedule_after(
            Self::sweep_factory(Arc::downgrade(self), |engine| async move { engine.run_delete_sweep().await }),
            self.config.delete_sweep_interval,
            true,
        )?;
        Ok(())
    }

    /// Sweeps hold only a weak reference to the engine so the scheduler does not keep it alive
    fn sweep_factory<F, Fut>(engine: Weak<ProtocolEngine>, sweep: F) -> TaskFactory
    where
        F: Fn(Arc<ProtocolEngine>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(move || -> Task {
            let sweep_future = engine.upgrade().map(&sweep);
            Box::pin(async move {
                if let Some(sweep_future) = sweep_future {
                    sweep_future.await;
                }
            })
        })
    }

    pub async fn shutdown(&self) {
        info!("shutting down protocol engine");
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
    }

    /// Sends a message, returning the message id if it is sent through a reliable handshake.
    ///
    /// NB: Every 65536th message to a given peer is sent through a handshake regardless of
    ///  `delivery`, to let the peer reset its timestamp tracking
    pub async fn send(&self, to: SocketAddr, fields: &FieldMap, delivery: Delivery) -> anyhow::Result<Option<u32>> {
        let timestamp = self.next_outgoing_timestamp(to).await;
        let message_id = if delivery == Delivery::Reliable || timestamp == WRAPAROUND_TIMESTAMP {
            Some(self.message_ids.next_id())
        }
        else {
            None
        };

        let options = FrameOptions {
            message_id,
            timestamp: Some(timestamp),
            double_content_count: fields.requires_double_content_count(),
        };
        let frame = encode(fields.values(), &options)?.freeze();
        if frame.len() > self.config.max_datagram_size {
            bail!("message to {:?} has {} bytes, exceeding the maximum datagram size of {}", to, frame.len(), self.config.max_datagram_size);
        }

        let record = match message_id {
            Some(message_id) => {
                let (record, _) = self.store.connection_or_insert(ConnectionKey::new(to, message_id, Role::Sender)).await;
                let mut state = record.lock().await;
                state.status = HandshakeStatus::SynSent;
                state.last_sent = Some(frame.clone());
                state.touch();
                drop(state);
                Some(record)
            }
            None => None,
        };

        trace!("sending {:?} frame with timestamp {} to {:?}", message_id, timestamp, to);
        if let Err(e) = self.socket.send_to(to, &frame).await {
            error!("error sending to {:?}: {}", to, e);
            if let Some(record) = record {
                self.store.mark_for_deletion(Record::Connection(record)).await;
            }
            return Err(e.into());
        }
        Ok(message_id)
    }

    /// Sending counts as interaction with the peer, so its record (and the outgoing counter
    ///  with it) is only evicted after a period of silence in both directions
    async fn next_outgoing_timestamp(&self, to: SocketAddr) -> u16 {
        let peer = self.store.peer(to).await;
        peer.touch().await;
        peer.next_outgoing_timestamp().await
    }

    /// Retransmits a buffered SYN with a fresh timestamp. The original timestamp may have
    ///  become stale at the receiver in the meantime, e.g. because a newer frame to the same
    ///  peer got through first.
    pub(super) async fn resend_syn(&self, record: Arc<ConnectionRecord>, syn: &[u8]) {
        let to = record.key().peer;
        match self.restamped(to, syn).await {
            Ok(frame) => {
                let mut state = record.lock().await;
                if state.status != HandshakeStatus::SynSent {
                    trace!("SYN #{} to {:?} was answered in the meantime - not retransmitting", record.key().message_id, to);
                    return;
                }
                state.last_sent = Some(frame.clone());
                drop(state);
                self.send_for_record(to, &frame, Some(Record::Connection(record))).await;
            }
            Err(e) => {
                error!("cannot retransmit SYN #{} to {:?}: {}", record.key().message_id, to, e);
                self.store.mark_for_deletion(Record::Connection(record)).await;
            }
        }
    }

    async fn restamped(&self, to: SocketAddr, syn: &[u8]) -> anyhow::Result<Bytes> {
        let decoded = decode(syn)?;
        let options = FrameOptions {
            message_id: decoded.header.message_id,
            timestamp: Some(self.next_outgoing_timestamp(to).await),
            double_content_count: decoded.header.flags.contains(FrameFlags::DOUBLE_CONTENT_COUNT),
        };
        let frame = encode(decoded.fields.values(), &options)?.freeze();
        if frame.len() > self.config.max_datagram_size {
            bail!("retransmitted SYN has {} bytes, exceeding the maximum datagram size of {}", frame.len(), self.config.max_datagram_size);
        }
        Ok(frame)
    }

    /// Hands a received datagram to the worker pool for processing
    pub fn dispatch_datagram(self: &Arc<Self>, from: SocketAddr, buf: Bytes) -> anyhow::Result<()> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);

        let engine = self.clone();
        self.pool.submit(async move {
            engine.on_datagram(from, &buf).await;
        }.instrument(span))
    }

    pub async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, buf);

        let frame = match decode(buf) {
            Ok(frame) => frame,
            Err(DecodeError::ChecksumMismatch { header, expected, actual }) => {
                debug!("checksum mismatch in datagram from {:?}: {:08x} != {:08x}", from, expected, actual);
                if let (Ok(FrameKind::Syn), Some(message_id)) = (header.kind(), header.message_id) {
                    self.on_rejected_syn(from, message_id).await;
                }
                return;
            }
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                return;
            }
        };

        let peer = self.store.peer(from).await;
        peer.touch().await;

        match (frame.kind, frame.header.message_id) {
            (FrameKind::Plain, _) => self.on_plain(from, &peer, frame.timestamp, frame.fields).await,
            (FrameKind::Syn, Some(message_id)) => self.on_syn(from, &peer, message_id, frame.timestamp, frame.fields).await,
            (FrameKind::SynSuccess, Some(message_id)) => self.on_syn_success(from, message_id).await,
            (FrameKind::SynFailure, Some(message_id)) => self.on_syn_failure(from, message_id).await,
            (FrameKind::SynAckSuccess, Some(message_id)) => self.on_syn_ack_success(from, message_id).await,
            (FrameKind::Ack, Some(message_id)) => self.on_ack(from, message_id).await,
            (kind, None) => {
                // the decoder guarantees a message id for reliable frames
                error!("{:?} frame from {:?} without message id - dropping", kind, from);
            }
        }
    }

    /// Sends a frame, expiring the record the frame belongs to if sending fails
    pub(super) async fn send_for_record(&self, to: SocketAddr, frame: &[u8], record: Option<Record>) {
        if let Err(e) = self.socket.send_to(to, frame).await {
            error!("error sending to {:?}: {}", to, e);
            if let Some(record) = record {
                self.store.mark_for_deletion(record).await;
            }
        }
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn active_connection_count(&self) -> usize {
        self.store.active_connection_count().await
    }

    pub async fn peer_count(&self) -> usize {
        self.store.peer_count().await
    }

    pub async fn pending_delete_count(&self) -> usize {
        self.store.pending_delete_count().await
    }
}

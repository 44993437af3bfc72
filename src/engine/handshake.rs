//! The handshake state machine. A reliable message goes through four frames:
//!
//! ```ascii
//! sender                               receiver
//!   | --- SYN (payload) ------------------> |   deliver once, status 'SYN-ACK sent'
//!   | <-- SYN success --------------------- |
//!   | --- SYN-ACK success ----------------> |   closed
//!   | <-- ACK ----------------------------- |
//! closed
//! ```
//!
//! The sender keeps the SYN for retransmission until it sees 'SYN success'. A rejected SYN
//!  (checksum or timestamp) is answered with 'SYN failure', which makes the sender retransmit
//!  right away. Every retransmission carries a fresh timestamp, so a SYN that was overtaken
//!  by newer frames to the same peer is not rejected as stale. Control frames carry no
//!  checksum, so they are never rejected.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::codec::{encode_control, FieldMap, FrameKind};
use crate::engine::protocol_engine::ProtocolEngine;
use crate::store::connection_record::{ConnectionKey, ConnectionRecord, HandshakeStatus, Role};
use crate::store::peer_record::PeerLivenessRecord;
use crate::store::Record;

impl ProtocolEngine {
    pub(super) async fn on_plain(&self, from: SocketAddr, peer: &PeerLivenessRecord, timestamp: Option<u16>, fields: FieldMap) {
        if let Some(timestamp) = timestamp {
            if !peer.accept_timestamp(timestamp).await {
                debug!("dropping stale or duplicate frame from {:?}", from);
                return;
            }
        }
        self.handler.on_message(from, None, fields).await;
    }

    pub(super) async fn on_syn(&self, from: SocketAddr, peer: &PeerLivenessRecord, message_id: u32, timestamp: Option<u16>, fields: FieldMap) {
        let (record, _) = self.store.connection_or_insert(ConnectionKey::new(from, message_id, Role::Receiver)).await;
        let mut state = record.lock().await;

        if state.status >= HandshakeStatus::SynAckSent {
            debug!("duplicate SYN #{} from {:?} - confirming again without delivering", message_id, from);
            state.touch();
            let reply = encode_control(FrameKind::SynSuccess, message_id).freeze();
            state.last_sent = Some(reply.clone());
            drop(state);
            self.send_for_record(from, &reply, Some(Record::Connection(record))).await;
            return;
        }

        // a SYN renegotiates timestamp tracking, but only if it is fresh itself
        let is_fresh = match timestamp {
            Some(timestamp) => peer.accept_timestamp(timestamp).await,
            None => true,
        };
        if !is_fresh {
            drop(state);
            self.on_rejected_syn(from, message_id).await;
            return;
        }
        peer.reset_timestamps(timestamp).await;

        trace!("accepted SYN #{} from {:?}", message_id, from);
        state.status = HandshakeStatus::SynAckSent;
        state.touch();
        let reply = encode_control(FrameKind::SynSuccess, message_id).freeze();
        state.last_sent = Some(reply.clone());
        drop(state);

        self.send_for_record(from, &reply, Some(Record::Connection(record))).await;
        self.handler.on_message(from, Some(message_id), fields).await;
    }

    /// A SYN that failed its checksum or timestamp validation
    pub(super) async fn on_rejected_syn(&self, from: SocketAddr, message_id: u32) {
        let (record, _) = self.store.connection_or_insert(ConnectionKey::new(from, message_id, Role::Receiver)).await;
        let mut state = record.lock().await;

        if state.status >= HandshakeStatus::SynAckSent {
            debug!("corrupt copy of SYN #{} from {:?}, which was already accepted - ignoring", message_id, from);
            return;
        }

        let reply = encode_control(FrameKind::SynFailure, message_id).freeze();
        let within_bound = state.register_failure();
        state.touch();
        state.last_sent = Some(reply.clone());
        drop(state);

        debug!("rejecting SYN #{} from {:?}", message_id, from);
        self.send_for_record(from, &reply, Some(Record::Connection(record.clone()))).await;

        if !within_bound {
            debug!("too many rejected SYNs #{} from {:?} - dropping the connection", message_id, from);
            self.store.mark_for_deletion(Record::Connection(record)).await;
        }
    }

    pub(super) async fn on_syn_success(&self, from: SocketAddr, message_id: u32) {
        let Some(record) = self.sender_record(from, message_id).await else {
            debug!("SYN success #{} from {:?} for unknown message - ignoring", message_id, from);
            return;
        };
        let mut state = record.lock().await;

        match state.status {
            HandshakeStatus::SynSent | HandshakeStatus::AckSent => {
                trace!("SYN #{} to {:?} was accepted", message_id, from);
                state.status = HandshakeStatus::AckSent;
                state.touch();
                let reply = encode_control(FrameKind::SynAckSuccess, message_id).freeze();
                state.last_sent = Some(reply.clone());
                drop(state);
                self.send_for_record(from, &reply, Some(Record::Connection(record))).await;
            }
            status => {
                debug!("SYN success #{} from {:?} in status {:?} - ignoring", message_id, from, status);
            }
        }
    }

    pub(super) async fn on_syn_failure(&self, from: SocketAddr, message_id: u32) {
        let Some(record) = self.sender_record(from, message_id).await else {
            debug!("SYN failure #{} from {:?} for unknown message - ignoring", message_id, from);
            return;
        };
        let mut state = record.lock().await;

        if state.status != HandshakeStatus::SynSent {
            debug!("SYN failure #{} from {:?} in status {:?} - ignoring", message_id, from, state.status);
            return;
        }
        let Some(syn) = state.last_sent.clone() else {
            warn!("no SYN #{} to {:?} buffered for retransmission", message_id, from);
            return;
        };

        if state.register_failure() {
            debug!("SYN #{} was rejected by {:?} - retransmitting (trial #{})", message_id, from, state.failure_trials);
            state.touch();
            drop(state);
            self.resend_syn(record, &syn).await;
        }
        else {
            debug!("SYN #{} was rejected by {:?} too often - giving up", message_id, from);
            drop(state);
            self.store.mark_for_deletion(Record::Connection(record)).await;
        }
    }

    pub(super) async fn on_syn_ack_success(&self, from: SocketAddr, message_id: u32) {
        let reply = encode_control(FrameKind::Ack, message_id).freeze();

        let Some(record) = self.store.connection(&ConnectionKey::new(from, message_id, Role::Receiver)).await else {
            // the connection may be closed already, and our ACK lost: acknowledge statelessly
            debug!("SYN-ACK success #{} from {:?} for unknown connection - acknowledging anyway", message_id, from);
            self.send_for_record(from, &reply, None).await;
            return;
        };

        let mut state = record.lock().await;
        if state.status != HandshakeStatus::SynAckSent {
            debug!("SYN-ACK success #{} from {:?} in status {:?} - ignoring", message_id, from, state.status);
            return;
        }
        trace!("closing connection #{} from {:?}", message_id, from);
        state.status = HandshakeStatus::Closed;
        state.last_sent = Some(reply.clone());
        drop(state);

        self.send_for_record(from, &reply, None).await;
        self.store.mark_for_deletion(Record::Connection(record)).await;
    }

    pub(super) async fn on_ack(&self, from: SocketAddr, message_id: u32) {
        let Some(record) = self.sender_record(from, message_id).await else {
            trace!("ACK #{} from {:?} for unknown message - ignoring", message_id, from);
            return;
        };

        let mut state = record.lock().await;
        if state.status < HandshakeStatus::AckSent {
            debug!("premature ACK #{} from {:?} in status {:?} - ignoring", message_id, from, state.status);
            return;
        }
        trace!("message #{} to {:?} was delivered", message_id, from);
        state.status = HandshakeStatus::Closed;
        drop(state);

        self.store.mark_for_deletion(Record::Connection(record)).await;
    }

    async fn sender_record(&self, peer: SocketAddr, message_id: u32) -> Option<Arc<ConnectionRecord>> {
        self.store.connection(&ConnectionKey::new(peer, message_id, Role::Sender)).await
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::store::connection_record::ConnectionRecord;
use crate::store::peer_record::PeerLivenessRecord;

/// What the timeout sweep should do with a record that has been idle for its full timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryAction {
    /// the record reset its tracking and stays alive
    Reset,
    /// the record stays alive, and this frame must be sent to the record's peer again
    Resend(Bytes),
    /// the record can be deleted
    Expire,
}

/// The contract shared by all records living in the [super::RecordStore]
#[async_trait]
pub trait ExpiringRecord: Send + Sync {
    fn timeout(&self) -> Duration;

    async fn touch(&self);

    async fn idle_time(&self, now: Instant) -> Duration;

    /// Called when the record was idle for at least [ExpiringRecord::timeout]
    async fn reset_or_expire(&self) -> ExpiryAction;

    fn is_being_deleted(&self) -> bool;

    fn mark_being_deleted(&self);
}

#[derive(Clone)]
pub enum Record {
    Peer(Arc<PeerLivenessRecord>),
    Connection(Arc<ConnectionRecord>),
}

impl Record {
    pub fn as_expiring(&self) -> &dyn ExpiringRecord {
        match self {
            Record::Peer(r) => r.as_ref(),
            Record::Connection(r) => r.as_ref(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Record::Peer(r) => r.addr(),
            Record::Connection(r) => r.key().peer,
        }
    }

    /// the number of handles to this record, including this one
    pub fn strong_count(&self) -> usize {
        match self {
            Record::Peer(r) => Arc::strong_count(r),
            Record::Connection(r) => Arc::strong_count(r),
        }
    }

    pub fn ptr_eq(&self, other: &Record) -> bool {
        match (self, other) {
            (Record::Peer(a), Record::Peer(b)) => Arc::ptr_eq(a, b),
            (Record::Connection(a), Record::Connection(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Record::Peer(r) => write!(f, "Peer({:?})", r.addr()),
            Record::Connection(r) => write!(f, "Connection({:?})", r.key()),
        }
    }
}

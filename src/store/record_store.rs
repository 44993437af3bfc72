use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::store::connection_record::{ConnectionKey, ConnectionRecord, Role};
use crate::store::deferred_delete::DeferredDeletePool;
use crate::store::peer_record::PeerLivenessRecord;
use crate::store::record::{ExpiringRecord, Record};

/// Owns all peer and connection records. Callers get `Arc` handles that are valid for the
///  duration of a callback. Removing a record moves it to a [DeferredDeletePool] rather than
///  freeing it, so a record is never freed while someone else is still working on it.
pub struct RecordStore {
    config: Arc<EngineConfig>,
    peers: RwLock<FxHashMap<SocketAddr, Arc<PeerLivenessRecord>>>,
    connections: RwLock<FxHashMap<ConnectionKey, Arc<ConnectionRecord>>>,
    pending_delete: DeferredDeletePool,
}

impl RecordStore {
    pub fn new(config: Arc<EngineConfig>) -> RecordStore {
        RecordStore {
            config,
            peers: Default::default(),
            connections: Default::default(),
            pending_delete: Default::default(),
        }
    }

    /// Returns the peer's record, creating it if this is the first contact
    pub async fn peer(&self, addr: SocketAddr) -> Arc<PeerLivenessRecord> {
        if let Some(peer) = self.existing_peer(addr).await {
            return peer;
        }

        let mut peers = self.peers.write().await;
        peers.entry(addr)
            .or_insert_with(|| {
                debug!("first contact with peer {:?}", addr);
                Arc::new(PeerLivenessRecord::new(addr, self.config.peer_timeout, self.config.peer_max_consecutive_timeouts))
            })
            .clone()
    }

    pub async fn existing_peer(&self, addr: SocketAddr) -> Option<Arc<PeerLivenessRecord>> {
        self.peers.read().await
            .get(&addr)
            .filter(|p| !p.is_being_deleted())
            .cloned()
    }

    pub async fn connection(&self, key: &ConnectionKey) -> Option<Arc<ConnectionRecord>> {
        self.connections.read().await
            .get(key)
            .filter(|c| !c.is_being_deleted())
            .cloned()
    }

    /// Returns the connection record for the key, creating a fresh one if there is none. The
    ///  flag is `true` if the record was created by this call.
    pub async fn connection_or_insert(&self, key: ConnectionKey) -> (Arc<ConnectionRecord>, bool) {
        if let Some(existing) = self.connection(&key).await {
            return (existing, false);
        }

        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(&key) {
            return (existing.clone(), false);
        }

        let failure_bound = match key.role {
            Role::Sender => self.config.sender_failure_bound,
            Role::Receiver => self.config.receiver_failure_bound,
        };
        trace!("creating connection record {:?}", key);
        let record = Arc::new(ConnectionRecord::new(key, self.config.connection_timeout, failure_bound));
        connections.insert(key, record.clone());
        (record, true)
    }

    /// Removes the record from the store. It stays in the pending-delete pool until it is
    ///  no longer referenced. Marking a record twice is a no-op.
    pub async fn mark_for_deletion(&self, record: Record) {
        let was_removed = match &record {
            Record::Peer(peer) => {
                let mut peers = self.peers.write().await;
                let is_current = peers.get(&peer.addr())
                    .is_some_and(|existing| Arc::ptr_eq(existing, peer));
                if is_current {
                    peer.mark_being_deleted();
                    peers.remove(&peer.addr());
                }
                is_current
            }
            Record::Connection(connection) => {
                let mut connections = self.connections.write().await;
                let is_current = connections.get(connection.key())
                    .is_some_and(|existing| Arc::ptr_eq(existing, connection));
                if is_current {
                    connection.mark_being_deleted();
                    connections.remove(connection.key());
                }
                is_current
            }
        };

        if was_removed {
            self.pending_delete.add(record).await;
        }
        else {
            trace!("{:?} is not in the store (any more) - ignoring", record);
        }
    }

    /// All live records, for sweeping
    pub async fn snapshot(&self) -> Vec<Record> {
        let mut result: Vec<Record> = self.peers.read().await
            .values()
            .map(|p| Record::Peer(p.clone()))
            .collect();
        result.extend(self.connections.read().await
            .values()
            .map(|c| Record::Connection(c.clone())));
        result
    }

    pub async fn sweep_deleted(&self, grace_period: Duration) -> usize {
        self.pending_delete.sweep(grace_period).await
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn pending_delete_count(&self) -> usize {
        self.pending_delete.len().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use super::*;

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(EngineConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)))))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_peer_is_created_once() {
        let store = store();
        assert!(store.existing_peer(addr(1)).await.is_none());

        let a = store.peer(addr(1)).await;
        let b = store.peer(addr(1)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.peer_count().await, 1);

        store.peer(addr(2)).await;
        assert_eq!(store.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_role_is_part_of_connection_key() {
        let store = store();

        let (sender, created) = store.connection_or_insert(ConnectionKey::new(addr(1), 5, Role::Sender)).await;
        assert!(created);
        let (receiver, created) = store.connection_or_insert(ConnectionKey::new(addr(1), 5, Role::Receiver)).await;
        assert!(created);
        assert!(!Arc::ptr_eq(&sender, &receiver));

        let (again, created) = store.connection_or_insert(ConnectionKey::new(addr(1), 5, Role::Sender)).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&sender, &again));
        assert_eq!(store.active_connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_marked_record_is_not_handed_out() {
        let store = store();
        let key = ConnectionKey::new(addr(1), 5, Role::Receiver);
        let (record, _) = store.connection_or_insert(key).await;

        store.mark_for_deletion(Record::Connection(record.clone())).await;
        assert!(record.is_being_deleted());
        assert!(store.connection(&key).await.is_none());
        assert_eq!(store.active_connection_count().await, 0);
        assert_eq!(store.pending_delete_count().await, 1);

        // marking again does not add a second entry
        store.mark_for_deletion(Record::Connection(record.clone())).await;
        assert_eq!(store.pending_delete_count().await, 1);

        let (fresh, created) = store.connection_or_insert(key).await;
        assert!(created);
        assert!(!Arc::ptr_eq(&record, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_held_across_sweep_is_not_freed() {
        let store = store();
        let (record, _) = store.connection_or_insert(ConnectionKey::new(addr(1), 5, Role::Sender)).await;
        let weak = Arc::downgrade(&record);

        store.mark_for_deletion(Record::Connection(record.clone())).await;
        advance(Duration::from_secs(5)).await;

        assert_eq!(store.sweep_deleted(Duration::from_secs(2)).await, 0);
        assert_eq!(store.pending_delete_count().await, 1);
        assert_eq!(record.key().message_id, 5);

        drop(record);
        assert_eq!(store.sweep_deleted(Duration::from_secs(2)).await, 1);
        assert_eq!(store.pending_delete_count().await, 0);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let store = store();
        store.peer(addr(1)).await;
        store.connection_or_insert(ConnectionKey::new(addr(1), 5, Role::Sender)).await;
        store.connection_or_insert(ConnectionKey::new(addr(2), 6, Role::Receiver)).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.iter().filter(|r| matches!(r, Record::Peer(_))).count(), 1);
    }
}

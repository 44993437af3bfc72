use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::store::record::{ExpiringRecord, ExpiryAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

/// Message ids are chosen independently by both peers, so the local role is part of the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub peer: SocketAddr,
    pub message_id: u32,
    pub role: Role,
}

impl ConnectionKey {
    pub fn new(peer: SocketAddr, message_id: u32, role: Role) -> ConnectionKey {
        ConnectionKey { peer, message_id, role }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HandshakeStatus {
    None = 0,
    SynSent = 1,
    SynAckSent = 2,
    AckSent = 3,
    Closed = 4,
}

pub struct ConnectionState {
    pub status: HandshakeStatus,
    /// the last frame sent for this handshake, kept for retransmission
    pub last_sent: Option<Bytes>,
    pub failure_trials: u32,
    pub last_interaction: Instant,
    failure_bound: u32,
}

impl ConnectionState {
    /// Counts a failed attempt, returning `false` if this exceeds the failure bound
    pub fn register_failure(&mut self) -> bool {
        self.failure_trials += 1;
        self.failure_trials <= self.failure_bound
    }

    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }
}

/// The state of a single reliable handshake, either as the sender or as the receiver of a
///  message. All fields are guarded by the record's own lock, which sequences the handling of
///  frames belonging to the same handshake.
pub struct ConnectionRecord {
    key: ConnectionKey,
    timeout: Duration,
    being_deleted: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl ConnectionRecord {
    pub fn new(key: ConnectionKey, timeout: Duration, failure_bound: u32) -> ConnectionRecord {
        ConnectionRecord {
            key,
            timeout,
            being_deleted: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                status: HandshakeStatus::None,
                last_sent: None,
                failure_trials: 0,
                last_interaction: Instant::now(),
                failure_bound,
            }),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub async fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> HandshakeStatus {
        self.state.lock().await.status
    }
}

#[async_trait]
impl ExpiringRecord for ConnectionRecord {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn touch(&self) {
        self.state.lock().await.touch();
    }

    async fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().await.last_interaction)
    }

    async fn reset_or_expire(&self) -> ExpiryAction {
        let mut state = self.state.lock().await;

        match (self.key.role, state.status, state.last_sent.clone()) {
            (Role::Sender, HandshakeStatus::SynSent, Some(syn)) => {
                if state.register_failure() {
                    trace!("{:?}: no response to SYN, retransmitting (trial #{})", self.key, state.failure_trials);
                    state.touch();
                    ExpiryAction::Resend(syn)
                }
                else {
                    debug!("{:?}: giving up after {} retransmissions", self.key, state.failure_trials - 1);
                    ExpiryAction::Expire
                }
            }
            (_, status, _) => {
                trace!("{:?}: timed out in status {:?}", self.key, status);
                ExpiryAction::Expire
            }
        }
    }

    fn is_being_deleted(&self) -> bool {
        self.being_deleted.load(Ordering::Acquire)
    }

    fn mark_being_deleted(&self) {
        self.being_deleted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn key(role: Role) -> ConnectionKey {
        ConnectionKey::new(SocketAddr::from(([1, 2, 3, 4], 5)), 17, role)
    }

    #[rstest]
    #[case::none(0, Some(HandshakeStatus::None))]
    #[case::syn_sent(1, Some(HandshakeStatus::SynSent))]
    #[case::syn_ack_sent(2, Some(HandshakeStatus::SynAckSent))]
    #[case::ack_sent(3, Some(HandshakeStatus::AckSent))]
    #[case::closed(4, Some(HandshakeStatus::Closed))]
    #[case::invalid(5, None)]
    fn test_status_from_raw(#[case] raw: u8, #[case] expected: Option<HandshakeStatus>) {
        assert_eq!(HandshakeStatus::try_from(raw).ok(), expected);
    }

    #[rstest]
    #[case::bound_0(0)]
    #[case::bound_2(2)]
    #[case::bound_5(5)]
    #[tokio::test(start_paused = true)]
    async fn test_sender_resends_until_bound(#[case] bound: u32) {
        let record = ConnectionRecord::new(key(Role::Sender), Duration::from_secs(1), bound);
        let syn = Bytes::from_static(&[1, 17, 0, 0, 0, 0, 0, 0, 0]);
        {
            let mut state = record.lock().await;
            state.status = HandshakeStatus::SynSent;
            state.last_sent = Some(syn.clone());
        }

        for _ in 0..bound {
            assert_eq!(record.reset_or_expire().await, ExpiryAction::Resend(syn.clone()));
        }
        assert_eq!(record.reset_or_expire().await, ExpiryAction::Expire);
    }

    #[rstest]
    #[case::sender_none(Role::Sender, HandshakeStatus::None)]
    #[case::sender_ack_sent(Role::Sender, HandshakeStatus::AckSent)]
    #[case::sender_closed(Role::Sender, HandshakeStatus::Closed)]
    #[case::receiver_none(Role::Receiver, HandshakeStatus::None)]
    #[case::receiver_syn_ack_sent(Role::Receiver, HandshakeStatus::SynAckSent)]
    #[case::receiver_closed(Role::Receiver, HandshakeStatus::Closed)]
    #[tokio::test]
    async fn test_expires(#[case] role: Role, #[case] status: HandshakeStatus) {
        let record = ConnectionRecord::new(key(role), Duration::from_secs(1), 5);
        {
            let mut state = record.lock().await;
            state.status = status;
            state.last_sent = Some(Bytes::from_static(&[2, 17, 0, 0, 0]));
        }
        assert_eq!(record.reset_or_expire().await, ExpiryAction::Expire);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_touches_record() {
        let record = ConnectionRecord::new(key(Role::Sender), Duration::from_secs(1), 5);
        {
            let mut state = record.lock().await;
            state.status = HandshakeStatus::SynSent;
            state.last_sent = Some(Bytes::from_static(&[1]));
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(record.idle_time(Instant::now()).await, Duration::from_secs(2));

        record.reset_or_expire().await;
        assert_eq!(record.idle_time(Instant::now()).await, Duration::ZERO);
    }

    #[test]
    fn test_register_failure() {
        let mut state = ConnectionState {
            status: HandshakeStatus::SynSent,
            last_sent: None,
            failure_trials: 0,
            last_interaction: Instant::now(),
            failure_bound: 2,
        };
        assert!(state.register_failure());
        assert!(state.register_failure());
        assert!(!state.register_failure());
        assert_eq!(state.failure_trials, 3);
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::store::record::{ExpiringRecord, ExpiryAction};

/// Liveness and replay tracking for a single remote endpoint.
///
/// Timestamps are a per-peer counter chosen by the sender. A frame is accepted if nothing
///  was recorded since the last reset, or if its timestamp is strictly greater than the
///  last accepted one. Duplicates and stale frames are rejected.
///
/// The record also holds the counter for frames sent *to* the peer, so that state for a
///  remote endpoint goes away with the record when the peer is evicted.
pub struct PeerLivenessRecord {
    addr: SocketAddr,
    timeout: Duration,
    max_consecutive_timeouts: u32,
    being_deleted: AtomicBool,
    state: Mutex<PeerState>,
}

struct PeerState {
    last_timestamp: Option<u16>,
    next_outgoing_timestamp: u16,
    consecutive_timeouts: u32,
    last_interaction: Instant,
}

impl PeerLivenessRecord {
    pub fn new(addr: SocketAddr, timeout: Duration, max_consecutive_timeouts: u32) -> PeerLivenessRecord {
        PeerLivenessRecord {
            addr,
            timeout,
            max_consecutive_timeouts,
            being_deleted: AtomicBool::new(false),
            state: Mutex::new(PeerState {
                last_timestamp: None,
                next_outgoing_timestamp: 0,
                consecutive_timeouts: 0,
                last_interaction: Instant::now(),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Records the timestamp if it is fresh, returning whether the frame should be accepted
    pub async fn accept_timestamp(&self, timestamp: u16) -> bool {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_timestamp {
            if timestamp <= last {
                debug!("stale timestamp {} from {:?}, last accepted was {}", timestamp, self.addr, last);
                return false;
            }
        }
        state.last_timestamp = Some(timestamp);
        true
    }

    /// Renegotiation: forget all previous timestamps, and start tracking from `timestamp`
    ///  if there is one
    pub async fn reset_timestamps(&self, timestamp: Option<u16>) {
        trace!("resetting timestamp tracking for {:?}", self.addr);
        self.state.lock().await.last_timestamp = timestamp;
    }

    pub async fn last_timestamp(&self) -> Option<u16> {
        self.state.lock().await.last_timestamp
    }

    pub async fn consecutive_timeouts(&self) -> u32 {
        self.state.lock().await.consecutive_timeouts
    }

    /// The timestamp for the next frame sent to this peer. Starts at 0 and wraps around.
    pub async fn next_outgoing_timestamp(&self) -> u16 {
        let mut state = self.state.lock().await;
        let result = state.next_outgoing_timestamp;
        state.next_outgoing_timestamp = result.wrapping_add(1);
        result
    }

    #[cfg(test)]
    pub(crate) async fn set_next_outgoing_timestamp(&self, timestamp: u16) {
        self.state.lock().await.next_outgoing_timestamp = timestamp;
    }
}

#[async_trait]
impl ExpiringRecord for PeerLivenessRecord {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn touch(&self) {
        let mut state = self.state.lock().await;
        state.last_interaction = Instant::now();
        state.consecutive_timeouts = 0;
    }

    async fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().await.last_interaction)
    }

    async fn reset_or_expire(&self) -> ExpiryAction {
        let mut state = self.state.lock().await;
        state.consecutive_timeouts += 1;
        state.last_timestamp = None;
        state.last_interaction = Instant::now();

        if state.consecutive_timeouts >= self.max_consecutive_timeouts {
            debug!("peer {:?} timed out {} times in a row - evicting", self.addr, state.consecutive_timeouts);
            ExpiryAction::Expire
        }
        else {
            trace!("peer {:?} timed out ({} consecutive)", self.addr, state.consecutive_timeouts);
            ExpiryAction::Reset
        }
    }

    fn is_being_deleted(&self) -> bool {
        self.being_deleted.load(Ordering::Acquire)
    }

    fn mark_being_deleted(&self) {
        self.being_deleted.store(true, Ordering::Release);
    }
}

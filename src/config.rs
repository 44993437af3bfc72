use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

pub struct EngineConfig {
    /// The address the UDP endpoint binds to. Port 0 lets the OS pick a port.
    pub self_addr: SocketAddr,

    /// Number of pool workers that process inbound datagrams and fired timers
    pub worker_count: usize,

    /// Granularity of the scheduler: delays are rounded up to a multiple of this
    pub scheduler_tick: Duration,

    /// Interval at which records are checked for timeouts, triggering retransmission or expiry
    pub timeout_sweep_interval: Duration,
    /// Interval at which records marked for deletion are actually freed
    pub delete_sweep_interval: Duration,
    /// A record marked for deletion stays around for at least this long, even if nobody
    ///  references it any more
    pub delete_grace_period: Duration,

    /// A peer without traffic for this long has its timestamp tracking reset
    pub peer_timeout: Duration,
    /// A peer that timed out this many times in a row is evicted
    pub peer_max_consecutive_timeouts: u32,

    /// Time after which a pending handshake step is retransmitted or given up
    pub connection_timeout: Duration,
    /// Number of SYN retransmissions before the sender gives up on a message
    pub sender_failure_bound: u32,
    /// Number of rejected SYNs after which the receiver drops its record
    pub receiver_failure_bound: u32,

    /// Size of the receive buffer, i.e. the biggest datagram that can be received without
    ///  truncation. 65507 is the maximum UDP payload for IPV4.
    pub max_datagram_size: usize,
}

impl EngineConfig {
    pub fn default_for(self_addr: SocketAddr) -> EngineConfig {
        EngineConfig {
            self_addr,
            worker_count: 4,
            scheduler_tick: Duration::from_millis(50),
            timeout_sweep_interval: Duration::from_millis(100),
            delete_sweep_interval: Duration::from_secs(1),
            delete_grace_period: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            peer_max_consecutive_timeouts: 12,
            connection_timeout: Duration::from_secs(1),
            sender_failure_bound: 5,
            receiver_failure_bound: 2,
            max_datagram_size: 65507,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            bail!("worker count must be at least 1");
        }
        if self.scheduler_tick.is_zero() {
            bail!("scheduler tick must be positive");
        }
        if self.timeout_sweep_interval < self.scheduler_tick || self.delete_sweep_interval < self.scheduler_tick {
            bail!("sweep intervals must not be shorter than the scheduler tick");
        }
        if self.peer_timeout.is_zero() || self.connection_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.peer_max_consecutive_timeouts == 0 {
            bail!("peer eviction requires at least one timeout");
        }
        if self.max_datagram_size < crate::codec::frame::MIN_FRAME_LEN {
            bail!("max datagram size is too small to hold a frame");
        }
        Ok(())
    }
}

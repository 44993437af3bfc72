//! This module contains utilities that are useful for testing code based on the protocol
//!  engine. They are used for testing the engine itself, but they are also exported for
//!  application testing.

pub mod collecting_handler;
pub mod simulated_network;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;

/// convenience method for unit test code: create a [SocketAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// A config for tests that drive sweeps manually: the scheduler's sweeps are so far apart
///  that they do not interfere with a test's explicit calls
pub fn test_config(self_addr: SocketAddr) -> Arc<EngineConfig> {
    let mut config = EngineConfig::default_for(self_addr);
    config.worker_count = 2;
    config.timeout_sweep_interval = Duration::from_secs(3600);
    config.delete_sweep_interval = Duration::from_secs(3600);
    Arc::new(config)
}

pub mod codec;
pub mod config;
pub mod engine;
pub mod executor;
pub mod store;
pub mod transport;
pub mod util;
pub mod test_util;

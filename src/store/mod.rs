pub mod connection_record;
pub mod deferred_delete;
pub mod peer_record;
pub mod record;
pub mod record_store;

pub use record::{ExpiringRecord, ExpiryAction, Record};
pub use record_store::RecordStore;

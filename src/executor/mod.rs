pub mod scheduler;
pub mod worker_pool;

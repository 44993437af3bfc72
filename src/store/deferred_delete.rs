use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::store::record::Record;

/// Records that were removed from the store but may still be referenced by running callbacks.
///  An entry is freed once nobody else holds it AND the grace period has passed.
#[derive(Default)]
pub struct DeferredDeletePool {
    entries: Mutex<Vec<(Record, Instant)>>,
}

impl DeferredDeletePool {
    pub async fn add(&self, record: Record) {
        trace!("deferring deletion of {:?}", record);
        self.entries.lock().await
            .push((record, Instant::now()));
    }

    /// Returns the number of freed records
    pub async fn sweep(&self, grace_period: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let len_before = entries.len();
        entries.retain(|(record, marked_at)| {
            record.strong_count() > 1 || now.saturating_duration_since(*marked_at) < grace_period
        });

        let num_freed = len_before - entries.len();
        if num_freed > 0 {
            trace!("freed {} records, {} still pending", num_freed, entries.len());
        }
        num_freed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

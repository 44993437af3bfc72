use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::protocol_engine::ProtocolEngine;
use crate::store::{ExpiryAction, Record};

impl ProtocolEngine {
    /// Checks all records for timeouts, retransmitting pending SYNs and expiring records that
    ///  are done or gave up
    pub async fn run_timeout_sweep(&self) {
        let now = Instant::now();
        let mut num_expired = 0;

        for record in self.store.snapshot().await {
            let expiring = record.as_expiring();
            if expiring.is_being_deleted() || expiring.idle_time(now).await < expiring.timeout() {
                continue;
            }

            match expiring.reset_or_expire().await {
                ExpiryAction::Reset => {}
                ExpiryAction::Resend(frame) => match &record {
                    Record::Connection(connection) => {
                        trace!("retransmitting to {:?}", record.peer_addr());
                        self.resend_syn(connection.clone(), &frame).await;
                    }
                    Record::Peer(_) => {
                        self.send_for_record(record.peer_addr(), &frame, None).await;
                    }
                }
                ExpiryAction::Expire => {
                    num_expired += 1;
                    self.store.mark_for_deletion(record.clone()).await;
                }
            }
        }

        if num_expired > 0 {
            debug!("timeout sweep expired {} records", num_expired);
        }
    }

    /// Frees records marked for deletion once they are unreferenced and their grace period
    ///  is over
    pub async fn run_delete_sweep(&self) {
        let num_freed = self.store.sweep_deleted(self.config.delete_grace_period).await;
        if num_freed > 0 {
            trace!("delete sweep freed {} records", num_freed);
        }
    }
}

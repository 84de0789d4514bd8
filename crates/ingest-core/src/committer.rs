//! Offset committer.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{BrokerConsumer, BrokerError};
use crate::ledger::OffsetLedger;
use crate::metrics::IngestMetrics;

/// Pushes the ledger's safe offsets to the broker.
///
/// Called after every delivered batch, when the broker is idle, and once more
/// after the shutdown drain. Commits are serialized so offsets reach the
/// broker in increasing order.
pub struct OffsetCommitter {
    ledger: Arc<OffsetLedger>,
    broker: Arc<dyn BrokerConsumer>,
    metrics: IngestMetrics,
    commit_lock: Mutex<()>,
}

impl OffsetCommitter {
    pub fn new(
        ledger: Arc<OffsetLedger>,
        broker: Arc<dyn BrokerConsumer>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            ledger,
            broker,
            metrics,
            commit_lock: Mutex::new(()),
        }
    }

    /// Commit every partition whose safe point advanced. Returns the number
    /// of partitions committed.
    pub async fn commit_ready(&self) -> Result<usize, BrokerError> {
        let _guard = self.commit_lock.lock().await;

        let ready = self.ledger.committable();
        if ready.is_empty() {
            return Ok(0);
        }

        match self.broker.commit(&ready).await {
            Ok(()) => {
                self.ledger.mark_committed(&ready);
                self.metrics.offsets_committed();
                for offset in &ready {
                    debug!(
                        topic = %offset.topic,
                        partition = offset.partition,
                        offset = offset.offset,
                        "Committed offset"
                    );
                }
                Ok(ready.len())
            }
            Err(e) => {
                self.metrics.commit_failed();
                warn!("Offset commit failed, will retry on next commit: {e}");
                Err(e)
            }
        }
    }
}

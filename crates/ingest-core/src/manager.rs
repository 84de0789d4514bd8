//! Channel manager.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use transit_types::Record;

use crate::channel::{ChannelSettings, ChannelWorker, DeliveryContext};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the key bytes. Stable across processes and platforms.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Channel a vehicle is pinned to.
pub fn channel_for(vehicle_id: &str, channels: usize) -> usize {
    if channels <= 1 {
        return 0;
    }
    (fnv1a_64(vehicle_id.as_bytes()) % channels as u64) as usize
}

/// Owns the channel workers and routes records to them.
pub(crate) struct ChannelManager {
    senders: Vec<mpsc::Sender<Record>>,
    handles: Vec<JoinHandle<()>>,
    close: CancellationToken,
    ctx: Arc<DeliveryContext>,
}

impl ChannelManager {
    pub fn start(config: &EngineConfig, ctx: Arc<DeliveryContext>) -> Self {
        let settings = ChannelSettings {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            max_queued_batches: config.max_queued_batches,
            shutdown_grace: config.shutdown_grace,
        };

        let close = CancellationToken::new();
        let mut senders = Vec::with_capacity(config.channels);
        let mut handles = Vec::with_capacity(config.channels);
        for id in 0..config.channels {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let worker = ChannelWorker::new(id, settings.clone(), rx, close.clone(), ctx.clone());
            handles.push(tokio::spawn(worker.run()));
            senders.push(tx);
        }
        info!(
            channels = config.channels,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Started ingestion channels"
        );

        Self {
            senders,
            handles,
            close,
            ctx,
        }
    }

    /// Send a record to its vehicle's channel. Waits while the channel is full.
    ///
    /// Returns `Ok(None)` when `cancel` fires before the channel has room; the
    /// record is then dropped and its offset stays uncommitted.
    pub async fn route(&self, record: Record, cancel: &CancellationToken) -> Result<Option<usize>> {
        let channel = channel_for(&record.vehicle_id, self.senders.len());
        self.ctx.metrics.record_routed(channel);
        tokio::select! {
            biased;
            sent = self.senders[channel].send(record) => {
                if sent.is_err() {
                    self.ctx.metrics.record_unrouted(channel);
                    return Err(EngineError::ChannelClosed(channel));
                }
                Ok(Some(channel))
            }
            _ = cancel.cancelled() => {
                self.ctx.metrics.record_unrouted(channel);
                Ok(None)
            }
        }
    }

    /// Stop accepting records and wait for every channel to drain. Each
    /// channel gives up on undelivered batches after the shutdown grace period.
    pub async fn shutdown(self) {
        let Self {
            senders,
            handles,
            close,
            ..
        } = self;
        drop(senders);
        close.cancel();
        for (channel, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(channel, "Channel task failed: {e}");
            }
        }
        info!("All channels drained");
    }
}

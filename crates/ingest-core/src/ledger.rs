//! Offset ledger.
//!
//! Tracks, per topic-partition, which broker offsets still have records that
//! the sink has not accepted. The committable offset of a partition is the
//! lowest offset that is still pending (or dead-lettered); when nothing is
//! outstanding it is one past the highest offset seen.
//!
//! Channels flush independently, so a record at offset 10 in channel 1 may be
//! accepted long after a record at offset 12 in channel 3. Committing only up
//! to the lowest outstanding offset keeps the broker from skipping records the
//! sink never received.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use transit_types::{PartitionOffset, SourcePosition, TopicPartition};

#[derive(Debug, Default)]
struct PartitionState {
    /// Offset -> number of records from that offset not yet accepted
    pending: BTreeMap<i64, u32>,
    /// Offset -> number of records from that offset that were dead-lettered
    fenced: BTreeMap<i64, u32>,
    highest_seen: Option<i64>,
    /// Next offset to consume, as last committed (or the first offset seen)
    committed: Option<i64>,
}

impl PartitionState {
    fn safe_point(&self) -> Option<i64> {
        let pending = self.pending.keys().next().copied();
        let fenced = self.fenced.keys().next().copied();
        match (pending, fenced) {
            (Some(p), Some(f)) => Some(p.min(f)),
            (Some(o), None) | (None, Some(o)) => Some(o),
            (None, None) => self.highest_seen.map(|h| h + 1),
        }
    }

    fn release(map: &mut BTreeMap<i64, u32>, offset: i64) -> bool {
        match map.get_mut(&offset) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                map.remove(&offset);
                true
            }
            None => false,
        }
    }
}

/// Commit state of one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSnapshot {
    pub topic: String,
    pub partition: i32,
    /// Next offset to consume as committed to the broker
    pub committed: Option<i64>,
    pub highest_seen: Option<i64>,
    /// Records not yet accepted by the sink
    pub pending_records: u64,
    /// Lowest dead-lettered offset holding back commits, if any
    pub fenced_at: Option<i64>,
}

/// Shared per-partition offset bookkeeping.
#[derive(Debug, Default)]
pub struct OffsetLedger {
    partitions: RwLock<HashMap<TopicPartition, Arc<Mutex<PartitionState>>>>,
}

fn lock(state: &Mutex<PartitionState>) -> MutexGuard<'_, PartitionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, tp: &TopicPartition) -> Arc<Mutex<PartitionState>> {
        if let Some(state) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tp)
        {
            return state.clone();
        }
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tp.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, tp: &TopicPartition) -> Option<Arc<Mutex<PartitionState>>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tp)
            .cloned()
    }

    /// Record that a broker message was polled and that `records` records
    /// decoded from it are about to enter the channels.
    ///
    /// Must be called before those records are routed. Messages with no
    /// forwarded records (rejected or empty payloads) pass `0`.
    pub fn admit(&self, position: &SourcePosition, records: u32) {
        let state = self.partition(&position.topic_partition());
        let mut state = lock(&state);
        let offset = position.offset;
        state.highest_seen = Some(state.highest_seen.map_or(offset, |h| h.max(offset)));
        if state.committed.is_none() {
            state.committed = Some(offset);
        }
        if records > 0 {
            *state.pending.entry(offset).or_insert(0) += records;
        }
    }

    /// Release records accepted by the sink.
    pub fn acknowledge<I>(&self, positions: I)
    where
        I: IntoIterator<Item = (TopicPartition, i64)>,
    {
        for (tp, offset) in positions {
            let Some(state) = self.existing(&tp) else {
                tracing::warn!(partition = %tp, offset, "Acknowledged offset for unknown partition");
                continue;
            };
            if !PartitionState::release(&mut lock(&state).pending, offset) {
                tracing::warn!(partition = %tp, offset, "Acknowledged offset that was not pending");
            }
        }
    }

    /// Mark records as dead-lettered. Their offsets stay outstanding, so the
    /// partition's commit point cannot move past them.
    pub fn fence<I>(&self, positions: I)
    where
        I: IntoIterator<Item = (TopicPartition, i64)>,
    {
        for (tp, offset) in positions {
            let Some(state) = self.existing(&tp) else {
                continue;
            };
            let mut state = lock(&state);
            if PartitionState::release(&mut state.pending, offset) {
                *state.fenced.entry(offset).or_insert(0) += 1;
            }
        }
    }

    /// Offsets that can be committed now, one per partition whose safe point
    /// moved past its last commit.
    pub fn committable(&self) -> Vec<PartitionOffset> {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ready: Vec<PartitionOffset> = partitions
            .iter()
            .filter_map(|(tp, state)| {
                let state = lock(state);
                let safe = state.safe_point()?;
                if state.committed.is_some_and(|c| safe <= c) {
                    return None;
                }
                Some(PartitionOffset {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: safe,
                })
            })
            .collect();
        ready.sort();
        ready
    }

    /// Record offsets the broker accepted.
    pub fn mark_committed(&self, offsets: &[PartitionOffset]) {
        for committed in offsets {
            if let Some(state) = self.existing(&committed.topic_partition()) {
                let mut state = lock(&state);
                if !matches!(state.committed, Some(c) if committed.offset <= c) {
                    state.committed = Some(committed.offset);
                }
            }
        }
    }

    /// Whether any partition is held back by a dead-lettered batch.
    pub fn any_fenced(&self) -> bool {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|state| !lock(state).fenced.is_empty())
    }

    pub fn pending_records(&self) -> u64 {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|state| lock(state).pending.values().map(|&c| c as u64).sum::<u64>())
            .sum()
    }

    pub fn snapshot(&self) -> Vec<PartitionSnapshot> {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<PartitionSnapshot> = partitions
            .iter()
            .map(|(tp, state)| {
                let state = lock(state);
                PartitionSnapshot {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    committed: state.committed,
                    highest_seen: state.highest_seen,
                    pending_records: state.pending.values().map(|&c| c as u64).sum(),
                    fenced_at: state.fenced.keys().next().copied(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        snapshot
    }
}

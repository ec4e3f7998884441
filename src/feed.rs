use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::FeedError;
use crate::flag::{FlagKey, FlagRecord, FlagSlot};

/// What a committed mutation did to its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Change {
    Upsert(FlagRecord),
    Delete,
}

/// One committed mutation. `seq` is assigned at append time and is
/// strictly increasing across the whole feed; `version` is the per-key
/// counter carried by the record or tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub seq: u64,
    pub key: FlagKey,
    pub version: u64,
    pub change: Change,
    pub committed_at: DateTime<Utc>,
}

struct FeedInner {
    retained: VecDeque<ChangeEntry>,
    next_seq: u64,
}

/// Append-only record of every committed mutation, with a bounded
/// retention window for replay and a broadcast channel for live tailing.
///
/// Entries are appended only after the durable write succeeded, in commit
/// order; the feed never reorders or drops an accepted entry. A consumer
/// that falls behind the retained window gets [`FeedError::ResyncRequired`]
/// and must reload a snapshot before resuming.
pub struct ChangeFeed {
    inner: Mutex<FeedInner>,
    tx: broadcast::Sender<ChangeEntry>,
    retention: usize,
}

impl ChangeFeed {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        let (tx, _) = broadcast::channel(retention);
        Self {
            inner: Mutex::new(FeedInner {
                retained: VecDeque::new(),
                next_seq: 1,
            }),
            tx,
            retention,
        }
    }

    /// Records a committed slot. Called by the coordinator only after the
    /// storage-level conditional write succeeded.
    pub(crate) fn append(&self, slot: &FlagSlot) -> ChangeEntry {
        let change = match slot {
            FlagSlot::Live(record) => Change::Upsert(record.clone()),
            FlagSlot::Tombstone(_) => Change::Delete,
        };

        let entry = {
            let mut inner = self.inner.lock();
            let entry = ChangeEntry {
                seq: inner.next_seq,
                key: slot.key().clone(),
                version: slot.version(),
                change,
                committed_at: Utc::now(),
            };
            inner.next_seq += 1;
            inner.retained.push_back(entry.clone());
            while inner.retained.len() > self.retention {
                inner.retained.pop_front();
            }
            entry
        };

        // No live subscribers is fine.
        let _ = self.tx.send(entry.clone());
        entry
    }

    /// Sequence number of the most recent entry, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Oldest sequence number still replayable, if any entry is retained.
    pub fn oldest_retained(&self) -> Option<u64> {
        self.inner.lock().retained.front().map(|entry| entry.seq)
    }

    /// All retained entries strictly after `from_seq`, in commit order.
    ///
    /// Fails with `ResyncRequired` when entries after `from_seq` have
    /// already been evicted from the retention window.
    pub fn replay(&self, from_seq: u64) -> Result<Vec<ChangeEntry>, FeedError> {
        let inner = self.inner.lock();
        match inner.retained.front().map(|entry| entry.seq) {
            None => {
                if from_seq + 1 < inner.next_seq {
                    Err(FeedError::ResyncRequired {
                        requested: from_seq,
                        oldest_retained: inner.next_seq,
                    })
                } else {
                    Ok(Vec::new())
                }
            }
            Some(oldest) => {
                if from_seq + 1 < oldest {
                    Err(FeedError::ResyncRequired {
                        requested: from_seq,
                        oldest_retained: oldest,
                    })
                } else {
                    Ok(inner
                        .retained
                        .iter()
                        .filter(|entry| entry.seq > from_seq)
                        .cloned()
                        .collect())
                }
            }
        }
    }
}

/// Lazy sequence of every entry after `from_seq`: replays the retained
/// window, then follows live commits. Runs until the caller drops it or
/// the feed itself is dropped.
///
/// A subscriber that lags the broadcast channel is first caught up from
/// the retention window; if the window has also moved on, the stream
/// yields `Err(ResyncRequired)` once and ends; the consumer reloads a
/// snapshot and resubscribes from its `as_of` sequence.
pub fn subscribe(
    feed: Arc<ChangeFeed>,
    from_seq: u64,
) -> Result<impl Stream<Item = Result<ChangeEntry, FeedError>> + Send + 'static, FeedError> {
    // Subscribe before snapshotting the backlog so nothing can fall
    // between replay and the live tail.
    let mut rx = feed.tx.subscribe();
    let backlog = feed.replay(from_seq)?;

    let stream = async_stream::stream! {
        let mut last_seen = from_seq;
        for entry in backlog {
            last_seen = entry.seq;
            yield Ok(entry);
        }

        loop {
            match rx.recv().await {
                Ok(entry) => {
                    // Overlap between the backlog and the channel buffer.
                    if entry.seq <= last_seen {
                        continue;
                    }
                    last_seen = entry.seq;
                    yield Ok(entry);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    match feed.replay(last_seen) {
                        Ok(entries) => {
                            for entry in entries {
                                last_seen = entry.seq;
                                yield Ok(entry);
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::flag::{FlagKey, Rollout};

    fn slot(name: &str, version: u64) -> FlagSlot {
        FlagSlot::Live(FlagRecord {
            key: FlagKey::new(name, "prod").unwrap(),
            enabled: true,
            rollout: Rollout::FULL,
            version,
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn appends_assign_increasing_seqs() {
        let feed = ChangeFeed::new(16);
        assert_eq!(feed.last_seq(), 0);
        assert_eq!(feed.append(&slot("a", 1)).seq, 1);
        assert_eq!(feed.append(&slot("b", 1)).seq, 2);
        assert_eq!(feed.append(&slot("a", 2)).seq, 3);
        assert_eq!(feed.last_seq(), 3);
    }

    #[test]
    fn replay_returns_entries_after_offset_in_order() {
        let feed = ChangeFeed::new(16);
        for version in 1..=4 {
            feed.append(&slot("a", version));
        }
        let entries = feed.replay(2).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn replay_past_retention_requires_resync() {
        let feed = ChangeFeed::new(2);
        for version in 1..=5 {
            feed.append(&slot("a", version));
        }
        assert_eq!(feed.oldest_retained(), Some(4));
        assert_eq!(
            feed.replay(0),
            Err(FeedError::ResyncRequired {
                requested: 0,
                oldest_retained: 4,
            })
        );
        // The newest retained offsets still replay.
        assert_eq!(feed.replay(3).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_follows_live_commits() {
        let feed = Arc::new(ChangeFeed::new(16));
        feed.append(&slot("a", 1));
        feed.append(&slot("a", 2));

        let mut stream = Box::pin(subscribe(Arc::clone(&feed), 0).unwrap());
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 2);

        feed.append(&slot("b", 1));
        let live = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("live entry not delivered")
            .unwrap()
            .unwrap();
        assert_eq!(live.seq, 3);
        assert_eq!(live.key, FlagKey::new("b", "prod").unwrap());
    }

    #[tokio::test]
    async fn subscribe_from_evicted_offset_fails_fast() {
        let feed = Arc::new(ChangeFeed::new(1));
        feed.append(&slot("a", 1));
        feed.append(&slot("a", 2));
        assert!(matches!(
            subscribe(feed, 0),
            Err(FeedError::ResyncRequired { .. })
        ));
    }

    #[tokio::test]
    async fn delete_entries_carry_no_record() {
        let feed = ChangeFeed::new(16);
        let entry = feed.append(&FlagSlot::Tombstone(crate::flag::Tombstone {
            key: FlagKey::new("a", "prod").unwrap(),
            version: 2,
            deleted_at: Utc::now(),
        }));
        assert_eq!(entry.change, Change::Delete);
        assert_eq!(entry.version, 2);
    }
}

// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Committed consumer offsets.
//!
//! Offsets live in the KV bucket [`OFFSET_BUCKET`] under
//! `"<queue id>-<consumer key>"`, encoded as `segment,position,version`.
//! Commits never move backwards: a commit older than the stored offset is an
//! invariant violation and panics.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{ConsumerConfig, Offset, QueueConfig, Result, error::KvStoreSnafu, kv::KvStore};

pub const OFFSET_BUCKET: &str = "queue_consumer_commit_offset";

pub struct OffsetStore {
    kv:     Arc<dyn KvStore>,
    /// Serializes read-check-write of commits.
    commit: Mutex<()>,
}

impl OffsetStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            commit: Mutex::new(()),
        }
    }

    fn key(queue: &QueueConfig, consumer: &ConsumerConfig) -> String {
        format!("{}-{}", queue.id, consumer.key())
    }

    /// Stored offset of `consumer`, or `0,0,0` when nothing was committed.
    pub fn get_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig) -> Result<Offset> {
        let key = Self::key(queue, consumer);
        let Some(raw) = self.kv.get(OFFSET_BUCKET, key.as_bytes())? else {
            return Ok(Offset::default());
        };
        let raw = std::str::from_utf8(&raw).map_err(|_| {
            KvStoreSnafu {
                message: format!("offset of {key} is not valid utf-8"),
            }
            .build()
        })?;
        Offset::decode(raw)
    }

    /// Stores `offset` for `consumer`.
    ///
    /// # Panics
    ///
    /// When the stored offset is later than `offset`.
    pub fn commit_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig, offset: Offset) -> Result<()> {
        let _guard = self.commit.lock();
        let stored = self.get_offset(queue, consumer)?;
        assert!(
            !stored.latest_than(&offset),
            "offset regression for {}: stored {}, committing {}",
            Self::key(queue, consumer),
            stored.encode(),
            offset.encode()
        );

        let key = Self::key(queue, consumer);
        self.kv
            .put(OFFSET_BUCKET, key.as_bytes(), offset.encode().as_bytes())?;
        debug!(key, offset = %offset, version = offset.version, "Committed offset");
        Ok(())
    }

    /// Resets `consumer` to `0,0` with a bumped version so commits carrying
    /// the old version are recognized as stale.
    pub fn delete_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig) -> Result<Offset> {
        let _guard = self.commit.lock();
        let stored = self.get_offset(queue, consumer)?;
        let reset = Offset::with_version(0, 0, stored.version + 1);

        let key = Self::key(queue, consumer);
        self.kv
            .put(OFFSET_BUCKET, key.as_bytes(), reset.encode().as_bytes())?;
        info!(key, version = reset.version, "Reset consumer offset");
        Ok(reset)
    }

    /// Removes the record entirely.
    pub fn remove_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig) -> Result<()> {
        let key = Self::key(queue, consumer);
        self.kv.delete(OFFSET_BUCKET, key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKvStore;

    fn store() -> OffsetStore { OffsetStore::new(Arc::new(MemoryKvStore::new())) }

    fn configs() -> (QueueConfig, ConsumerConfig) {
        (QueueConfig::new("orders"), ConsumerConfig::new("orders", "indexer", "node-1"))
    }

    #[test]
    fn test_absent_offset_is_zero() {
        let (queue, consumer) = configs();
        assert_eq!(store().get_offset(&queue, &consumer).unwrap(), Offset::default());
    }

    #[test]
    fn test_commit_and_get() {
        let store = store();
        let (queue, consumer) = configs();
        store
            .commit_offset(&queue, &consumer, Offset::new(1, 102))
            .unwrap();
        store
            .commit_offset(&queue, &consumer, Offset::new(1, 102))
            .unwrap();
        assert_eq!(store.get_offset(&queue, &consumer).unwrap(), Offset::new(1, 102));
    }

    #[test]
    #[should_panic(expected = "offset regression")]
    fn test_regressing_commit_panics() {
        let store = store();
        let (queue, consumer) = configs();
        store
            .commit_offset(&queue, &consumer, Offset::new(2, 10))
            .unwrap();
        let _ = store.commit_offset(&queue, &consumer, Offset::new(1, 500));
    }

    #[test]
    fn test_delete_bumps_version() {
        let store = store();
        let (queue, consumer) = configs();
        store
            .commit_offset(&queue, &consumer, Offset::new(7, 70))
            .unwrap();

        let reset = store.delete_offset(&queue, &consumer).unwrap();
        assert_eq!(reset, Offset::with_version(0, 0, 1));
        assert_eq!(store.get_offset(&queue, &consumer).unwrap(), reset);

        // Old-version commits now regress.
        let stale = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.commit_offset(&queue, &consumer, Offset::new(8, 0))
        }));
        assert!(stale.is_err());

        store
            .commit_offset(&queue, &consumer, Offset::with_version(0, 34, 1))
            .unwrap();
    }

    #[test]
    fn test_consumers_are_isolated() {
        let store = store();
        let queue = QueueConfig::new("orders");
        let a = ConsumerConfig::new("orders", "group-a", "n");
        let b = ConsumerConfig::new("orders", "group-b", "n");
        store.commit_offset(&queue, &a, Offset::new(3, 0)).unwrap();
        store.commit_offset(&queue, &b, Offset::new(1, 0)).unwrap();

        store.delete_offset(&queue, &a).unwrap();
        assert_eq!(store.get_offset(&queue, &b).unwrap(), Offset::new(1, 0));
    }

    #[test]
    fn test_legacy_two_field_value() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(OFFSET_BUCKET, b"orders-indexer-node-1", b"4,40").unwrap();
        let store = OffsetStore::new(kv);
        let (queue, consumer) = configs();
        assert_eq!(store.get_offset(&queue, &consumer).unwrap(), Offset::new(4, 40));
    }
}

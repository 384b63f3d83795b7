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

//! Registry of every disk queue under one data directory.
//!
//! [`DiskQueueModule`] opens queues lazily on first use and hands out
//! producers and consumer cursors. All queues share one configuration, one
//! capacity guard, one KV store and one lifecycle manager.
//!
//! ```ignore
//! let module = DiskQueueModuleBuilder::new("/var/lib/docspool").build()?;
//! module.start()?;
//!
//! let queue = QueueConfig::new("orders");
//! let consumer_config = ConsumerConfig::new("orders", "indexer", "node-1");
//!
//! module.push("orders", b"hello".to_vec())?;
//! let mut consumer = module.acquire_consumer(&queue, &consumer_config, None)?;
//! let mut ctx = FetchContext::default();
//! let (messages, _) = consumer.fetch_messages(&mut ctx, 100)?;
//! module.commit_offset(&queue, &consumer_config, ctx.next_offset)?;
//!
//! module.stop();
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    ConsumerConfig, DiskQueueConfig, Offset, QueueConfig, Result, WriteResponse,
    consumer::Consumer,
    kv::KvStore,
    lifecycle::{ConsumerProgress, LifecycleManager, SegmentLifecycle},
    message::check_message_size,
    object_store::ObjectStore,
    offset_store::OffsetStore,
    path::dir_size,
    producer::Producer,
    queue::{QueueEnv, SegmentLog},
};

/// Open logs and registered consumers, shared with the lifecycle manager.
struct Catalog {
    logs:      RwLock<HashMap<String, Arc<SegmentLog>>>,
    /// Registered consumers per queue id.
    consumers: RwLock<HashMap<String, Vec<ConsumerConfig>>>,
    offsets:   Arc<OffsetStore>,
}

impl Catalog {
    fn committed_segments(&self, queue: &str) -> Vec<u64> {
        let queue_config = QueueConfig::new(queue);
        let consumers = self.consumers.read();
        consumers
            .get(queue)
            .into_iter()
            .flatten()
            .filter_map(|consumer| match self.offsets.get_offset(&queue_config, consumer) {
                Ok(offset) => Some(offset.segment),
                Err(e) => {
                    warn!(queue, consumer = %consumer.key(), error = ?e, "Failed to read committed offset");
                    None
                }
            })
            .collect()
    }
}

impl ConsumerProgress for Catalog {
    fn consumer_count(&self, queue: &str) -> usize { self.consumers.read().get(queue).map_or(0, Vec::len) }

    fn earliest_segment(&self, queue: &str) -> Option<u64> {
        if self.consumer_count(queue) == 0 {
            return None;
        }
        let reading = self
            .logs
            .read()
            .get(queue)
            .and_then(|log| log.earliest_reader_segment());
        self.committed_segments(queue)
            .into_iter()
            .chain(reading)
            .min()
    }

    fn latest_segment(&self, queue: &str) -> Option<u64> { self.committed_segments(queue).into_iter().max() }
}

/// Entry point for all disk queues of a data directory.
pub struct DiskQueueModule {
    data_dir:     PathBuf,
    env:          QueueEnv,
    kv:           Arc<dyn KvStore>,
    object_store: Option<Arc<dyn ObjectStore>>,
    offsets:      Arc<OffsetStore>,
    catalog:      Arc<Catalog>,
    /// Serializes queue initialization.
    init_lock:    Mutex<()>,
    manager:      Mutex<Option<LifecycleManager>>,
}

impl DiskQueueModule {
    pub(crate) fn new(
        data_dir: PathBuf,
        config: DiskQueueConfig,
        kv: Arc<dyn KvStore>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let env = QueueEnv::new(&data_dir, config, object_store.clone());
        let offsets = Arc::new(OffsetStore::new(kv.clone()));
        let catalog = Arc::new(Catalog {
            logs:      RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            offsets:   offsets.clone(),
        });
        Self {
            data_dir,
            env,
            kv,
            object_store,
            offsets,
            catalog,
            init_lock: Mutex::new(()),
            manager: Mutex::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path { &self.data_dir }

    pub fn config(&self) -> &DiskQueueConfig { &self.env.config }

    pub fn offsets(&self) -> &OffsetStore { &self.offsets }

    pub fn is_readonly(&self) -> bool { self.env.capacity.is_readonly() }

    /// Opens `queue_id` if it is not open yet.
    ///
    /// # Panics
    ///
    /// When `queue_id` is empty.
    pub fn init(&self, queue_id: &str) -> Result<Arc<SegmentLog>> {
        assert!(!queue_id.is_empty(), "queue id must not be empty");
        if let Some(log) = self.catalog.logs.read().get(queue_id) {
            return Ok(log.clone());
        }

        let _guard = self.init_lock.lock();
        if let Some(log) = self.catalog.logs.read().get(queue_id) {
            return Ok(log.clone());
        }

        let consumer_mode = self.catalog.consumer_count(queue_id) > 0;
        let log = Arc::new(SegmentLog::open(queue_id, &self.env, consumer_mode)?);
        self.catalog
            .logs
            .write()
            .insert(queue_id.to_string(), log.clone());
        debug!(queue = queue_id, consumer_mode, "Queue initialized");
        Ok(log)
    }

    fn opened(&self, queue_id: &str) -> Option<Arc<SegmentLog>> { self.catalog.logs.read().get(queue_id).cloned() }

    /// Appends one message to `queue_id`.
    pub fn push(&self, queue_id: &str, data: impl Into<Bytes>) -> Result<WriteResponse> {
        let data = data.into();
        check_message_size(data.len(), &self.env.config)?;
        self.init(queue_id)?.put(data)
    }

    /// Takes the next channel-mode message, waiting at most `timeout` or
    /// forever when `None`. `Ok(None)` means the wait timed out.
    pub fn pop(&self, queue_id: &str, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        self.init(queue_id)?.pop(timeout)
    }

    pub fn read_chan(&self, queue_id: &str) -> Result<Receiver<Bytes>> { Ok(self.init(queue_id)?.read_chan()) }

    pub fn depth(&self, queue_id: &str) -> Result<i64> { Ok(self.init(queue_id)?.depth()) }

    pub fn latest_offset(&self, queue_id: &str) -> Result<Offset> { Ok(self.init(queue_id)?.latest_offset()) }

    /// Bytes used by the queue directory, compressed segments included.
    pub fn get_storage_size(&self, queue_id: &str) -> Result<u64> { dir_size(self.init(queue_id)?.queue_dir()) }

    /// Opens a cursor for `consumer` at `start`, or at its committed offset.
    /// The consumer is registered with the queue.
    pub fn acquire_consumer(
        &self,
        queue: &QueueConfig,
        consumer: &ConsumerConfig,
        start: Option<Offset>,
    ) -> Result<Consumer> {
        self.register_consumer(&queue.id, consumer.clone());
        let log = self.init(&queue.id)?;
        let start = match start {
            Some(start) => start,
            None => self.offsets.get_offset(queue, consumer)?,
        };
        Consumer::open(log, queue.clone(), consumer.clone(), self.offsets.clone(), start)
    }

    pub fn release_consumer(&self, mut consumer: Consumer) { consumer.close(); }

    /// # Panics
    ///
    /// When the queue id is empty.
    pub fn acquire_producer(&self, queue: &QueueConfig) -> Result<Producer> {
        let log = self.init(&queue.id)?;
        Ok(Producer::new(log, queue.clone()))
    }

    pub fn release_producer(&self, producer: Producer) { drop(producer); }

    pub fn get_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig) -> Result<Offset> {
        self.offsets.get_offset(queue, consumer)
    }

    /// # Panics
    ///
    /// When `offset` is older than the committed offset.
    pub fn commit_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig, offset: Offset) -> Result<()> {
        self.offsets.commit_offset(queue, consumer, offset)
    }

    pub fn delete_offset(&self, queue: &QueueConfig, consumer: &ConsumerConfig) -> Result<Offset> {
        self.offsets.delete_offset(queue, consumer)
    }

    /// Registers `consumer` for `queue_id`, switching the queue to cursor
    /// mode.
    pub fn register_consumer(&self, queue_id: &str, consumer: ConsumerConfig) {
        assert!(!queue_id.is_empty(), "queue id must not be empty");
        {
            let mut consumers = self.catalog.consumers.write();
            let registered = consumers.entry(queue_id.to_string()).or_default();
            if registered.iter().any(|c| c.key() == consumer.key()) {
                return;
            }
            info!(queue = queue_id, consumer = %consumer.key(), "Consumer registered");
            registered.push(consumer);
        }
        if let Some(log) = self.opened(queue_id) {
            log.enable_consumer_mode();
        }
    }

    /// Unregisters the consumer with `consumer_key`. Returns whether it was
    /// registered.
    pub fn remove_consumer(&self, queue_id: &str, consumer_key: &str) -> bool {
        let mut consumers = self.catalog.consumers.write();
        let Some(registered) = consumers.get_mut(queue_id) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|c| c.key() != consumer_key);
        let removed = registered.len() != before;
        if removed {
            info!(queue = queue_id, consumer = consumer_key, "Consumer removed");
        }
        removed
    }

    pub fn consumers(&self, queue_id: &str) -> Vec<ConsumerConfig> {
        self.catalog
            .consumers
            .read()
            .get(queue_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn earliest_consumer_segment(&self, queue_id: &str) -> Option<u64> { self.catalog.earliest_segment(queue_id) }

    pub fn latest_consumer_segment(&self, queue_id: &str) -> Option<u64> { self.catalog.latest_segment(queue_id) }

    pub fn consumer_count(&self, queue_id: &str) -> usize { self.catalog.consumer_count(queue_id) }

    /// Ids of every open queue.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.catalog.logs.read().keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Closes `queue_id` after a final sync.
    ///
    /// # Panics
    ///
    /// When `queue_id` is not open.
    pub fn close(&self, queue_id: &str) -> Result<()> {
        let Some(log) = self.catalog.logs.write().remove(queue_id) else {
            panic!("queue {queue_id} is not open");
        };
        log.close()
    }

    /// Closes `queue_id` and deletes its directory. Unknown queues are
    /// ignored.
    pub fn destroy(&self, queue_id: &str) -> Result<()> {
        let Some(log) = self.catalog.logs.write().remove(queue_id) else {
            return Ok(());
        };
        log.destroy()?;
        self.catalog.consumers.write().remove(queue_id);
        info!(queue = queue_id, "Queue destroyed");
        Ok(())
    }

    /// Starts the lifecycle manager.
    pub fn start(&self) -> Result<()> {
        let mut manager = self.manager.lock();
        if manager.is_some() {
            return Ok(());
        }
        self.env.shutdown.store(false, Ordering::Release);

        let lifecycle = SegmentLifecycle::new(
            self.env.config.clone(),
            self.env.resolver.clone(),
            self.kv.clone(),
            self.object_store.clone(),
            self.env.capacity.clone(),
            self.catalog.clone(),
        );
        *manager = Some(LifecycleManager::start(lifecycle, self.env.notifier.clone())?);
        info!(data_dir = ?self.data_dir, "Disk queue module started");
        Ok(())
    }

    /// Signals shutdown, stops the lifecycle manager and closes every queue.
    pub fn stop(&self) {
        self.env.shutdown.store(true, Ordering::Release);
        if let Some(mut manager) = self.manager.lock().take() {
            manager.stop();
        }

        let logs: Vec<(String, Arc<SegmentLog>)> = self.catalog.logs.write().drain().collect();
        for (queue, log) in logs {
            if let Err(e) = log.close() {
                error!(queue, error = ?e, "Failed to close queue");
            }
        }
        info!(data_dir = ?self.data_dir, "Disk queue module stopped");
    }
}

impl Drop for DiskQueueModule {
    fn drop(&mut self) {
        if self.manager.get_mut().is_some() || !self.catalog.logs.read().is_empty() {
            self.stop();
        }
    }
}

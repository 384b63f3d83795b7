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

//! Background maintenance of closed segments.
//!
//! The [`LifecycleManager`] consumes [`SegmentEvent`]s on one thread:
//!
//! | Event           | Work                                                   |
//! |-----------------|--------------------------------------------------------|
//! | `WriteComplete` | compress idle segments, upload to the cold tier,       |
//! |                 | re-check disk capacity, delete unused local segments   |
//! | `ReadComplete`  | decompress segments ahead of readers, delete unused    |
//!
//! Handlers run one at a time, so compression, upload and deletion never race
//! on the same segment. A failing handler is logged and the manager moves on
//! to the next event.

mod cleanup;
mod compress;
mod upload;

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::{
    DiskQueueConfig, Result,
    capacity::CapacityGuard,
    event::{EventNotifier, SegmentEvent, SegmentEventKind},
    kv::KvStore,
    object_store::ObjectStore,
    resolve::SegmentResolver,
};

/// Consumer positions the lifecycle manager must not outrun.
pub trait ConsumerProgress: Send + Sync {
    /// Registered consumers of `queue`.
    fn consumer_count(&self, queue: &str) -> usize;

    /// Lowest segment any consumer still needs, `None` without consumers.
    fn earliest_segment(&self, queue: &str) -> Option<u64>;

    /// Highest committed segment, `None` without consumers.
    fn latest_segment(&self, queue: &str) -> Option<u64>;
}

/// Event handlers and the collaborators they need.
pub(crate) struct SegmentLifecycle {
    config:        Arc<DiskQueueConfig>,
    resolver:      Arc<SegmentResolver>,
    kv:            Arc<dyn KvStore>,
    object_store:  Option<Arc<dyn ObjectStore>>,
    capacity:      Arc<CapacityGuard>,
    progress:      Arc<dyn ConsumerProgress>,
    /// Last segment decompressed ahead of readers, per queue.
    last_prepared: HashMap<String, u64>,
}

impl SegmentLifecycle {
    pub fn new(
        config: Arc<DiskQueueConfig>,
        resolver: Arc<SegmentResolver>,
        kv: Arc<dyn KvStore>,
        object_store: Option<Arc<dyn ObjectStore>>,
        capacity: Arc<CapacityGuard>,
        progress: Arc<dyn ConsumerProgress>,
    ) -> Self {
        Self {
            config,
            resolver,
            kv,
            object_store,
            capacity,
            progress,
            last_prepared: HashMap::new(),
        }
    }

    pub fn handle(&mut self, event: &SegmentEvent) {
        debug!(queue = %event.queue, kind = ?event.kind, segment = event.segment, "Handling segment event");
        let queue = event.queue.as_str();
        match event.kind {
            SegmentEventKind::WriteComplete => {
                self.compress_segments(queue, event.segment);
                self.upload_segments(queue, event.segment);
                if let Err(e) = self.capacity.check() {
                    warn!(queue, error = %e, "Disk capacity check failed");
                }
                self.delete_unused_segments(queue, event.segment);
            }
            SegmentEventKind::ReadComplete => {
                if self.config.prepare_files_to_read {
                    self.prepare_segments(queue, event.segment);
                }
                self.delete_unused_segments(queue, event.segment);
            }
        }
    }

    fn queue_dir(&self, queue: &str) -> PathBuf { self.resolver.queue_dir(queue) }

    fn log_failure(queue: &str, segment: u64, what: &str, result: Result<()>) {
        if let Err(e) = result {
            error!(queue, segment, error = ?e, "Failed to {what}");
        }
    }
}

/// Runs [`SegmentLifecycle`] on a background thread fed by an
/// [`EventNotifier`].
pub struct LifecycleManager {
    notifier: EventNotifier,
    join:     Option<JoinHandle<()>>,
}

impl LifecycleManager {
    pub(crate) fn start(lifecycle: SegmentLifecycle, notifier: EventNotifier) -> Result<Self> {
        let rx = notifier.attach(lifecycle.config.notify_chan_buffer_size);
        let join = thread::Builder::new()
            .name("queue-lifecycle".to_string())
            .spawn(move || run(lifecycle, &rx))?;
        info!("Segment lifecycle manager started");
        Ok(Self {
            notifier,
            join: Some(join),
        })
    }

    pub fn is_running(&self) -> bool { self.join.is_some() }

    /// Stops accepting events, drains the buffered ones and joins the thread.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.notifier.detach();
        if join.join().is_err() {
            error!("Segment lifecycle manager panicked");
        }
        info!("Segment lifecycle manager stopped");
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) { self.stop(); }
}

fn run(mut lifecycle: SegmentLifecycle, rx: &Receiver<SegmentEvent>) {
    for event in rx {
        let handled = panic::catch_unwind(AssertUnwindSafe(|| lifecycle.handle(&event)));
        if handled.is_err() {
            error!(queue = %event.queue, kind = ?event.kind, segment = event.segment, "Segment event handler panicked");
        }
    }
}

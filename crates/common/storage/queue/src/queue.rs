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

//! Segment log handle and lifecycle management.
//!
//! A [`SegmentLog`] is the per-queue entry point. It manages:
//! - Recovery of existing data on startup
//! - The background [`IoWorker`](crate::io_worker) thread owning all writes
//! - The channel-mode read-ahead channel
//! - Tracking of which segment every live cursor is reading
//!
//! ## Usage
//!
//! ```ignore
//! let log = SegmentLog::open("orders", &env, false)?;
//!
//! let response = log.put(Bytes::from_static(b"hello"))?;
//! let data = log.pop(Some(Duration::from_secs(1)))?;
//!
//! log.close()?;
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::{
    DiskQueueConfig, Offset, Result,
    capacity::CapacityGuard,
    error::{ChannelRecvSnafu, ExitingSnafu, InternalSnafu, WriteTimeoutSnafu},
    event::{EventNotifier, SegmentEventKind},
    io_worker::{Control, IoWorker, WorkerChannels},
    message::{WriteRequest, WriteResponse},
    metadata::MetadataFile,
    object_store::ObjectStore,
    path::{compressed_path, remove_if_exists, scan_segments, segment_path},
    recovery::recover,
    resolve::SegmentResolver,
    throttle::LogThrottle,
};

/// Collaborators shared by every queue of one module.
#[derive(Clone)]
pub struct QueueEnv {
    pub config:   Arc<DiskQueueConfig>,
    pub resolver: Arc<SegmentResolver>,
    pub notifier: EventNotifier,
    pub capacity: Arc<CapacityGuard>,
    /// Set once the owning module shuts down.
    pub shutdown: Arc<AtomicBool>,
}

impl QueueEnv {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        config: DiskQueueConfig,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let data_dir = data_dir.as_ref();
        let capacity = Arc::new(CapacityGuard::new(data_dir, &config));
        let config = Arc::new(config);
        Self {
            resolver: Arc::new(SegmentResolver::new(data_dir, config.clone(), object_store)),
            config,
            notifier: EventNotifier::new(),
            capacity,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutting_down(&self) -> bool { self.shutdown.load(Ordering::Acquire) }
}

/// State the worker publishes for readers that must not go through its
/// channels.
#[derive(Debug, Default)]
pub(crate) struct QueueShared {
    write_offset:  RwLock<Offset>,
    depth:         AtomicI64,
    consumer_mode: AtomicBool,
    /// Segment currently read by each live cursor.
    readers:       Mutex<HashMap<String, u64>>,
}

impl QueueShared {
    pub fn new(consumer_mode: bool) -> Self {
        Self {
            consumer_mode: AtomicBool::new(consumer_mode),
            ..Self::default()
        }
    }

    pub fn write_offset(&self) -> Offset { *self.write_offset.read() }

    pub fn set_write_offset(&self, segment: u64, position: u64) {
        *self.write_offset.write() = Offset::new(segment, position);
    }

    pub fn depth(&self) -> i64 { self.depth.load(Ordering::Acquire) }

    pub fn set_depth(&self, depth: i64) { self.depth.store(depth, Ordering::Release); }

    pub fn is_consumer_mode(&self) -> bool { self.consumer_mode.load(Ordering::Acquire) }

    pub fn set_consumer_mode(&self, enabled: bool) { self.consumer_mode.store(enabled, Ordering::Release); }
}

struct WorkerHandle {
    write_tx:   Sender<WriteRequest>,
    control_tx: Sender<Control>,
    exit_tx:    Sender<bool>,
    join:       JoinHandle<()>,
}

/// A durable segmented log for one queue.
///
/// Safe to share across threads. Writes are serialized by the worker thread;
/// cursors read segment files independently.
pub struct SegmentLog {
    name:      String,
    queue_dir: PathBuf,
    env:       QueueEnv,
    shared:    Arc<QueueShared>,
    read_rx:   Receiver<Bytes>,
    /// `None` once close or delete has begun.
    worker:    RwLock<Option<WorkerHandle>>,
    throttle:  LogThrottle,
}

impl SegmentLog {
    /// Open or create the log of `name` under the module data directory.
    ///
    /// Recovers metadata and the write segment tail, then spawns the worker.
    /// A `WriteComplete` for the last closed segment is announced so work
    /// left over from a previous process gets scheduled.
    pub fn open(name: &str, env: &QueueEnv, consumer_mode: bool) -> Result<Self> {
        let queue_dir = env.resolver.queue_dir(name);
        std::fs::create_dir_all(&queue_dir)?;

        let metadata_file = MetadataFile::new(&queue_dir);
        if env.config.cleanup_files_on_init {
            remove_all_segments(&queue_dir)?;
            metadata_file.remove()?;
            info!(queue = name, "Removed existing segments on init");
        }

        let info = recover(&queue_dir, &metadata_file, &env.config)?;

        let shared = Arc::new(QueueShared::new(consumer_mode));
        let worker = IoWorker::new(
            name,
            queue_dir.clone(),
            env,
            shared.clone(),
            metadata_file,
            info.metadata,
        );

        let (write_tx, write_rx) = channel::bounded(env.config.write_chan_buffer_size);
        let (control_tx, control_rx) = channel::bounded(0);
        let (exit_tx, exit_rx) = channel::bounded(1);
        let (read_tx, read_rx) = channel::bounded(env.config.read_chan_buffer_size);

        let join = thread::Builder::new()
            .name(format!("queue-io-{name}"))
            .spawn(move || {
                worker.run(WorkerChannels {
                    write_rx,
                    control_rx,
                    exit_rx,
                    read_tx,
                });
            })?;

        let write_offset = shared.write_offset();
        info!(
            queue = name,
            write_segment = write_offset.segment,
            write_position = write_offset.position,
            depth = shared.depth(),
            consumer_mode,
            "Segment log opened"
        );

        if write_offset.segment > 0
            && (env.config.cleanup_files_on_init || env.config.upload_to_s3)
        {
            env.notifier.notify(
                name,
                SegmentEventKind::WriteComplete,
                write_offset.segment - 1,
            );
        }

        Ok(Self {
            name: name.to_string(),
            queue_dir,
            env: env.clone(),
            shared,
            read_rx,
            worker: RwLock::new(Some(WorkerHandle {
                write_tx,
                control_tx,
                exit_tx,
                join,
            })),
            throttle: LogThrottle::default(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn queue_dir(&self) -> &Path { &self.queue_dir }

    pub(crate) const fn env(&self) -> &QueueEnv { &self.env }

    /// Appends one message.
    ///
    /// Blocks until the worker acknowledged the write or `write_timeout`
    /// elapsed. Returns the write position after the message.
    pub fn put(&self, data: impl Into<Bytes>) -> Result<WriteResponse> {
        let guard = self.worker.read();
        let Some(worker) = guard.as_ref() else {
            if self.throttle.allow("exiting", &self.name) {
                error!(queue = %self.name, "Rejecting write on exiting queue");
            }
            return ExitingSnafu { queue: &self.name }.fail();
        };
        if self.env.capacity.is_readonly() {
            return Err(self.env.capacity.reject_write(&self.name));
        }

        let timeout = self.env.config.write_timeout();
        let deadline = Instant::now() + timeout;
        let (resp_tx, resp_rx) = channel::bounded(1);
        let request = WriteRequest {
            data: data.into(),
            resp: resp_tx,
        };

        match worker.write_tx.send_deadline(request, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                return WriteTimeoutSnafu {
                    queue: &self.name,
                    timeout,
                }
                .fail();
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                return ExitingSnafu { queue: &self.name }.fail();
            }
        }

        match resp_rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => WriteTimeoutSnafu {
                queue: &self.name,
                timeout,
            }
            .fail(),
            Err(RecvTimeoutError::Disconnected) => ChannelRecvSnafu.fail(),
        }
    }

    /// Channel-mode payloads in FIFO order. Empty while the queue is in
    /// cursor mode.
    pub fn read_chan(&self) -> Receiver<Bytes> { self.read_rx.clone() }

    /// Takes the next channel-mode payload, waiting at most `timeout`, or
    /// forever when `None`. `Ok(None)` means the wait timed out.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let received = match timeout {
            Some(timeout) => self.read_rx.recv_timeout(timeout),
            None => self
                .read_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => ExitingSnafu { queue: &self.name }.fail(),
        }
    }

    /// Unread messages as counted by the worker.
    pub fn depth(&self) -> i64 {
        let guard = self.worker.read();
        let Some(worker) = guard.as_ref() else {
            return self.shared.depth();
        };
        let (tx, rx) = channel::bounded(1);
        if worker.control_tx.send(Control::Depth(tx)).is_err() {
            return self.shared.depth();
        }
        rx.recv().unwrap_or_else(|_| self.shared.depth())
    }

    /// Current write position.
    pub fn latest_offset(&self) -> Offset { self.shared.write_offset() }

    pub fn is_consumer_mode(&self) -> bool { self.shared.is_consumer_mode() }

    /// Switches the queue to cursor mode. The switch is permanent for the
    /// lifetime of this log.
    pub fn enable_consumer_mode(&self) {
        if !self.shared.is_consumer_mode() {
            info!(queue = %self.name, "Switching queue to cursor mode");
            self.shared.set_consumer_mode(true);
        }
    }

    /// Deletes every segment and the metadata, keeping the log open.
    pub fn empty(&self) -> Result<()> { self.control(Control::Empty) }

    /// Abandons the remainder of the write segment.
    pub fn skip_to_next_writable(&self) -> Result<()> { self.control(Control::SkipToNextWritable) }

    fn control(&self, make: fn(Sender<Result<()>>) -> Control) -> Result<()> {
        let guard = self.worker.read();
        let Some(worker) = guard.as_ref() else {
            return ExitingSnafu { queue: &self.name }.fail();
        };
        let (tx, rx) = channel::bounded(1);
        worker
            .control_tx
            .send(make(tx))
            .map_err(|_| ExitingSnafu { queue: &self.name }.build())?;
        rx.recv().map_err(|_| ChannelRecvSnafu.build())?
    }

    /// Stops the worker after a final sync.
    pub fn close(&self) -> Result<()> { self.exit(true) }

    /// Stops the worker without syncing.
    pub fn delete(&self) -> Result<()> { self.exit(false) }

    /// Closes the log and removes its directory.
    pub fn destroy(&self) -> Result<()> {
        self.exit(false)?;
        if self.queue_dir.exists() {
            std::fs::remove_dir_all(&self.queue_dir)?;
        }
        info!(queue = %self.name, "Segment log destroyed");
        Ok(())
    }

    fn exit(&self, sync: bool) -> Result<()> {
        let Some(worker) = self.worker.write().take() else {
            return Ok(());
        };
        info!(queue = %self.name, sync, "Closing segment log");

        let _ = worker.exit_tx.send(sync);
        drop(worker.write_tx);
        drop(worker.control_tx);
        worker.join.join().map_err(|_| {
            InternalSnafu {
                message: format!("io worker of queue {} panicked", self.name),
            }
            .build()
        })
    }

    pub(crate) fn update_reader(&self, cursor_id: &str, segment: u64) {
        self.shared
            .readers
            .lock()
            .insert(cursor_id.to_string(), segment);
    }

    pub(crate) fn remove_reader(&self, cursor_id: &str) { self.shared.readers.lock().remove(cursor_id); }

    /// Lowest segment any live cursor is reading.
    pub fn earliest_reader_segment(&self) -> Option<u64> { self.shared.readers.lock().values().min().copied() }

    pub fn reader_count(&self) -> usize { self.shared.readers.lock().len() }
}

impl Drop for SegmentLog {
    fn drop(&mut self) {
        if let Err(e) = self.exit(true) {
            error!(queue = %self.name, error = ?e, "Failed to close segment log on drop");
        }
    }
}

fn remove_all_segments(queue_dir: &Path) -> Result<()> {
    for segment in scan_segments(queue_dir)? {
        let path = segment_path(queue_dir, segment);
        remove_if_exists(&compressed_path(&path))?;
        remove_if_exists(&path)?;
    }
    Ok(())
}

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

//! Background I/O worker owning the write path of one segment log.
//!
//! ## Architecture
//!
//! The IoWorker runs on a dedicated thread and is the only code that mutates
//! writer state, the channel-mode reader and `meta.dat`. Handles talk to it
//! exclusively over crossbeam channels:
//!
//! ```text
//! ┌──────────────┐   write / control   ┌──────────────┐    append    ┌──────────────┐
//! │  SegmentLog  │ ──── channels ────► │   IoWorker   │ ──────────►  │   Segment    │
//! │   (caller)   │ ◄─── read-ahead ─── │  (bg thread) │              │ NNNNNNNNN.dat│
//! └──────────────┘                     └──────┬───────┘              └──────────────┘
//!                                             │ WriteComplete
//!                                             ▼
//!                                      lifecycle manager
//! ```
//!
//! ## Responsibilities
//!
//! - **Message persistence**: frame and append payloads to the write segment
//! - **Segment rolling**: close a segment once it reaches `max_bytes_per_file`
//! - **Sync management**: fsync and persist metadata every `sync_every_records`
//!   operations or `sync_timeout`
//! - **Channel-mode reads**: read ahead and offer the next payload while no
//!   consumer cursor exists
//! - **Tail checks**: detect and heal reader/writer state that crossed over

use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Select, Sender};
use snafu::ensure;
use tracing::{debug, error, info, trace, warn};

use crate::{
    DiskQueueConfig, Result,
    compression::{compress_message, decompress_message},
    error::{InternalSnafu, InvalidMessageSizeSnafu, SegmentNotFoundSnafu},
    event::{EventNotifier, SegmentEventKind},
    message::{
        MESSAGE_LENGTH_SIZE, WriteRequest, WriteResponse, check_message_size, encode_frame,
        message_disk_size, valid_frame_length,
    },
    metadata::{MetadataFile, QueueMetadata},
    path::{bad_path, compressed_path, remove_if_exists, segment_path},
    queue::{QueueEnv, QueueShared},
    resolve::SegmentResolver,
};

/// Requests other than writes, each answered on its own channel.
#[derive(Debug)]
pub(crate) enum Control {
    Depth(Sender<i64>),
    /// Delete every segment and the metadata file.
    Empty(Sender<Result<()>>),
    /// Abandon the rest of the write segment and continue on a fresh one.
    SkipToNextWritable(Sender<Result<()>>),
}

pub(crate) struct WorkerChannels {
    pub write_rx:   Receiver<WriteRequest>,
    pub control_rx: Receiver<Control>,
    /// Carries whether to sync before exiting.
    pub exit_rx:    Receiver<bool>,
    pub read_tx:    Sender<Bytes>,
}

pub(crate) struct IoWorker {
    /// Queue id, used in logs and events.
    name:          String,
    /// Directory holding the segments and `meta.dat`.
    queue_dir:     PathBuf,
    config:        Arc<DiskQueueConfig>,
    /// Restores compressed or uploaded segments for the channel reader.
    resolver:      Arc<SegmentResolver>,
    /// Receives a rollover event for every closed segment.
    notifier:      EventNotifier,
    /// Offsets and mode flags published to other threads.
    shared:        Arc<QueueShared>,
    metadata_file: MetadataFile,

    /// Messages written but not yet handed to the pop channel. Negative
    /// only after metadata corruption, healed at the tail.
    depth:                   i64,
    write_segment:           u64,
    /// Byte offset of the next frame in `write_segment`.
    write_position:          u64,
    /// Open handle of `write_segment`, created lazily.
    write_file:              Option<File>,
    /// Position of the next frame for the pop channel.
    read_segment:            u64,
    read_position:           u64,
    /// Position after the frame being offered to the pop channel. Becomes
    /// the read position once the send completes.
    next_read_segment:       u64,
    next_read_position:      u64,
    read_file:               Option<BufReader<File>>,
    /// Size bound of the channel-mode read segment.
    max_bytes_per_file_read: u64,
    /// Metadata changed since the last `meta.dat` write.
    need_sync:               bool,
    /// Reused frame encoding buffer.
    write_buf:               Vec<u8>,
}

impl IoWorker {
    /// Builds a worker from recovered metadata and heals crossed-over
    /// reader/writer state before anything is published.
    pub fn new(
        name: &str,
        queue_dir: PathBuf,
        env: &QueueEnv,
        shared: Arc<QueueShared>,
        metadata_file: MetadataFile,
        metadata: QueueMetadata,
    ) -> Self {
        let mut worker = Self {
            name: name.to_string(),
            queue_dir,
            config: env.config.clone(),
            resolver: env.resolver.clone(),
            notifier: env.notifier.clone(),
            shared,
            metadata_file,
            depth: metadata.depth,
            write_segment: metadata.write_segment,
            write_position: metadata.write_position,
            write_file: None,
            read_segment: metadata.read_segment,
            read_position: metadata.read_position,
            next_read_segment: metadata.read_segment,
            next_read_position: metadata.read_position,
            read_file: None,
            max_bytes_per_file_read: 0,
            need_sync: false,
            write_buf: Vec::new(),
        };
        worker.check_tail_corruption();
        worker.publish();
        worker
    }

    /// Main run loop.
    ///
    /// Each iteration syncs if due, reads ahead one payload in channel mode,
    /// then services exactly one of: a write, a control request, the sync
    /// ticker, the exit signal, or a hand-off of the read-ahead payload.
    pub fn run(mut self, channels: WorkerChannels) {
        let WorkerChannels {
            write_rx,
            control_rx,
            exit_rx,
            read_tx,
        } = channels;
        let ticker = channel::tick(self.config.sync_timeout());
        let mut count = 0u64;
        let mut pending: Option<Bytes> = None;

        info!(queue = %self.name, write_segment = self.write_segment, "IoWorker starting");

        loop {
            if count >= self.config.sync_every_records {
                self.need_sync = true;
            }
            if self.need_sync {
                if let Err(e) = self.sync() {
                    error!(queue = %self.name, error = ?e, "Failed to sync queue");
                }
                count = 0;
            }

            let channel_mode = !self.shared.is_consumer_mode();
            if channel_mode && pending.is_none() && self.has_unread() {
                match self.read_one() {
                    Ok(Some(data)) => pending = Some(data),
                    Ok(None) => continue,
                    Err(e) => {
                        error!(
                            queue = %self.name,
                            segment = self.read_segment,
                            position = self.read_position,
                            error = ?e,
                            "Channel reader failed"
                        );
                        self.handle_read_error();
                        continue;
                    }
                }
            }

            let mut sel = Select::new();
            let write_idx = sel.recv(&write_rx);
            let control_idx = sel.recv(&control_rx);
            let tick_idx = sel.recv(&ticker);
            let exit_idx = sel.recv(&exit_rx);
            let read_idx = (channel_mode && pending.is_some()).then(|| sel.send(&read_tx));

            let oper = sel.select();
            let index = oper.index();

            if index == write_idx {
                let Ok(request) = oper.recv(&write_rx) else {
                    self.exit(true);
                    break;
                };
                count += 1;
                let result = self.write_one(&request.data);
                let _ = request.resp.send(result);
            } else if index == control_idx {
                let Ok(control) = oper.recv(&control_rx) else {
                    self.exit(true);
                    break;
                };
                self.handle_control(control, &mut pending);
            } else if index == tick_idx {
                let _ = oper.recv(&ticker);
                if count > 0 {
                    self.need_sync = true;
                }
            } else if index == exit_idx {
                let sync = oper.recv(&exit_rx).unwrap_or(true);
                self.exit(sync);
                break;
            } else if Some(index) == read_idx {
                if let Some(data) = pending.take() {
                    match oper.send(&read_tx, data) {
                        Ok(()) => {
                            count += 1;
                            self.read_move_forward();
                        }
                        Err(e) => pending = Some(e.into_inner()),
                    }
                }
            }
        }
    }

    fn handle_control(&mut self, control: Control, pending: &mut Option<Bytes>) {
        match control {
            Control::Depth(resp) => {
                let _ = resp.send(self.depth);
            }
            Control::Empty(resp) => {
                info!(queue = %self.name, "Emptying queue");
                pending.take();
                let _ = resp.send(self.delete_all_files());
            }
            Control::SkipToNextWritable(resp) => {
                warn!(queue = %self.name, segment = self.write_segment, "Skipping to next writable segment");
                pending.take();
                let _ = resp.send(self.skip_to_next_rw_file(false));
            }
        }
    }

    fn exit(&mut self, sync: bool) {
        self.read_file = None;
        if sync && let Err(e) = self.sync() {
            error!(queue = %self.name, error = ?e, "Failed to sync on exit");
        }
        self.write_file = None;
        info!(queue = %self.name, sync, "IoWorker stopped");
    }

    /// Frames and appends one payload, rolling the segment once it is full.
    fn write_one(&mut self, data: &Bytes) -> Result<WriteResponse> {
        let payload = if self.config.compress.message.enabled {
            compress_message(data, self.config.compress.message.level)?
        } else {
            data.clone()
        };
        check_message_size(payload.len(), &self.config)?;

        if self.write_file.is_none() {
            self.write_file = Some(self.open_write_file()?);
        }

        self.write_buf.clear();
        encode_frame(&mut self.write_buf, &payload);

        let Some(file) = self.write_file.as_mut() else {
            return InternalSnafu {
                message: "write segment is not open",
            }
            .fail();
        };
        if let Err(e) = file.write_all(&self.write_buf) {
            self.write_file = None;
            return Err(e.into());
        }

        self.write_position += self.write_buf.len() as u64;
        self.depth += 1;

        if self.write_position >= self.config.max_bytes_per_file {
            if self.read_segment == self.write_segment {
                self.max_bytes_per_file_read = self.write_position;
            }

            let closed = self.write_segment;
            let size = self.write_position;
            self.write_segment += 1;
            self.write_position = 0;

            if let Err(e) = self.sync() {
                error!(queue = %self.name, segment = closed, error = ?e, "Failed to sync closed segment");
            }
            self.write_file = None;
            self.publish();

            info!(queue = %self.name, segment = closed, size, "Segment closed");
            self.notifier
                .notify(&self.name, SegmentEventKind::WriteComplete, closed);
        } else {
            self.publish();
        }

        Ok(WriteResponse {
            segment:  self.write_segment,
            position: self.write_position,
        })
    }

    fn open_write_file(&self) -> Result<File> {
        let path = segment_path(&self.queue_dir, self.write_segment);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if self.write_position > 0 {
            file.seek(SeekFrom::Start(self.write_position))?;
        }
        debug!(queue = %self.name, path = ?path, position = self.write_position, "Opened write segment");
        Ok(file)
    }

    fn sync(&mut self) -> Result<()> {
        let synced = self.write_file.as_ref().map(File::sync_all).transpose();
        if let Err(e) = synced {
            self.write_file = None;
            return Err(e.into());
        }
        self.metadata_file.write(&self.metadata())?;
        self.need_sync = false;
        Ok(())
    }

    const fn metadata(&self) -> QueueMetadata {
        QueueMetadata {
            depth:          self.depth,
            read_segment:   self.read_segment,
            read_position:  self.read_position,
            write_segment:  self.write_segment,
            write_position: self.write_position,
        }
    }

    fn publish(&self) {
        self.shared
            .set_write_offset(self.write_segment, self.write_position);
        self.shared.set_depth(self.depth);
    }

    const fn has_unread(&self) -> bool {
        self.read_segment < self.write_segment
            || (self.read_segment == self.write_segment && self.read_position < self.write_position)
    }

    /// Reads the frame at the channel-mode read position. Returns `None` when
    /// the frame was consumed without producing a payload.
    fn read_one(&mut self) -> Result<Option<Bytes>> {
        if self.read_file.is_none() {
            let (path, exists) = self.resolver.resolve(&self.name, self.read_segment);
            ensure!(exists, SegmentNotFoundSnafu { path });

            let mut file = File::open(&path)?;
            if self.read_position > 0 {
                file.seek(SeekFrom::Start(self.read_position))?;
            }
            self.max_bytes_per_file_read = if self.read_segment < self.write_segment {
                file.metadata()?.len()
            } else {
                self.config.max_bytes_per_file
            };
            self.read_file = Some(BufReader::new(file));
        }

        let result = match self.read_file.as_mut() {
            Some(reader) => read_frame(reader, &self.config),
            None => InternalSnafu {
                message: "read segment is not open",
            }
            .fail(),
        };
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                self.read_file = None;
                return Err(e);
            }
        };

        self.next_read_segment = self.read_segment;
        self.next_read_position = self.read_position + message_disk_size(payload.len());

        if self.read_segment < self.write_segment
            && self.next_read_position >= self.max_bytes_per_file_read
        {
            self.read_file = None;
            self.next_read_segment += 1;
            self.next_read_position = 0;
        }

        if !self.config.compress.message.enabled {
            return Ok(Some(payload));
        }
        match decompress_message(&payload) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                error!(
                    queue = %self.name,
                    segment = self.read_segment,
                    position = self.read_position,
                    error = ?e,
                    "Dropping undecodable message"
                );
                self.read_move_forward();
                Ok(None)
            }
        }
    }

    fn read_move_forward(&mut self) {
        let old_segment = self.read_segment;
        self.read_segment = self.next_read_segment;
        self.read_position = self.next_read_position;
        self.depth -= 1;

        if old_segment != self.next_read_segment {
            self.need_sync = true;
            debug!(queue = %self.name, segment = old_segment, "Channel reader drained segment");
            if !self.shared.is_consumer_mode() {
                let path = segment_path(&self.queue_dir, old_segment);
                for file in [compressed_path(&path), path] {
                    if let Err(e) = remove_if_exists(&file) {
                        error!(queue = %self.name, path = ?file, error = ?e, "Failed to remove drained segment");
                    }
                }
            }
        }

        self.check_tail_corruption();
        self.publish();
    }

    /// Moves the channel reader past a segment it cannot read.
    fn handle_read_error(&mut self) {
        if self.shared.is_consumer_mode() {
            return;
        }

        if self.read_segment == self.write_segment {
            self.write_file = None;
            self.write_segment += 1;
            self.write_position = 0;
        }

        let path = segment_path(&self.queue_dir, self.read_segment);
        if path.exists() {
            let bad = bad_path(&path);
            match std::fs::rename(&path, &bad) {
                Ok(()) => warn!(queue = %self.name, path = ?bad, "Moved unreadable segment aside"),
                Err(e) => error!(queue = %self.name, path = ?path, error = ?e, "Failed to rename unreadable segment"),
            }
        }

        self.read_file = None;
        self.read_segment += 1;
        self.read_position = 0;
        self.next_read_segment = self.read_segment;
        self.next_read_position = 0;
        self.need_sync = true;
        self.publish();
    }

    /// Heals the state once the reader has caught up with or overtaken the
    /// writer.
    fn check_tail_corruption(&mut self) {
        let read = (self.read_segment, self.read_position);
        let write = (self.write_segment, self.write_position);
        if read < write {
            return;
        }

        if self.depth != 0 {
            if self.depth < 0 {
                error!(queue = %self.name, depth = self.depth, "Negative depth at tail, metadata corruption, resetting");
            } else {
                error!(queue = %self.name, depth = self.depth, "Positive depth at tail, data loss, resetting");
            }
            self.depth = 0;
            self.need_sync = true;
        }

        if read != write {
            error!(
                queue = %self.name,
                read_segment = self.read_segment,
                read_position = self.read_position,
                write_segment = self.write_segment,
                write_position = self.write_position,
                "Reader ahead of writer, skipping to next writable segment"
            );
            if let Err(e) = self.skip_to_next_rw_file(true) {
                error!(queue = %self.name, error = ?e, "Failed to skip to next writable segment");
            }
            self.need_sync = true;
        }
    }

    fn skip_to_next_rw_file(&mut self, delete: bool) -> Result<()> {
        let mut result = Ok(());
        self.read_file = None;
        if let Some(file) = self.write_file.take()
            && let Err(e) = file.sync_all()
        {
            result = Err(e.into());
        }

        if delete {
            for segment in self.read_segment..=self.write_segment {
                let path = segment_path(&self.queue_dir, segment);
                for file in [compressed_path(&path), path] {
                    if let Err(e) = remove_if_exists(&file) {
                        error!(queue = %self.name, path = ?file, error = ?e, "Failed to remove segment");
                        result = Err(e.into());
                    }
                }
            }
        }

        self.write_segment += 1;
        self.write_position = 0;
        self.read_segment = self.write_segment;
        self.read_position = 0;
        self.next_read_segment = self.write_segment;
        self.next_read_position = 0;
        self.depth = 0;
        self.need_sync = true;
        self.publish();

        trace!(queue = %self.name, write_segment = self.write_segment, "Skipped to next writable segment");
        result
    }

    fn delete_all_files(&mut self) -> Result<()> {
        // Segments from 0 are removed so cursor-mode queues empty fully too.
        self.read_segment = 0;
        self.skip_to_next_rw_file(true)?;
        self.metadata_file.remove()
    }
}

/// Reads one length-prefixed frame.
pub(crate) fn read_frame<R: Read>(reader: &mut R, config: &DiskQueueConfig) -> Result<Bytes> {
    let mut length_buf = [0u8; MESSAGE_LENGTH_SIZE];
    reader.read_exact(&mut length_buf)?;
    let length = u32::from_be_bytes(length_buf);
    ensure!(
        valid_frame_length(length, config),
        InvalidMessageSizeSnafu {
            size: length as usize,
            min:  config.min_msg_size,
            max:  config.max_msg_size,
        }
    );

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;
    use crate::{path::queue_dir, queue::QueueEnv};

    struct WorkerFixture {
        _temp_dir: TempDir,
        env:       QueueEnv,
        queue_dir: PathBuf,
        shared:    Arc<QueueShared>,
    }

    impl WorkerFixture {
        fn new(max_bytes_per_file: u64) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = DiskQueueConfig {
                max_bytes_per_file,
                ..DiskQueueConfig::default()
            };
            let env = QueueEnv::new(temp_dir.path(), config, None);
            let queue_dir = queue_dir(temp_dir.path(), "q");
            std::fs::create_dir_all(&queue_dir).unwrap();
            Self {
                _temp_dir: temp_dir,
                env,
                queue_dir,
                shared: Arc::new(QueueShared::new(true)),
            }
        }

        fn worker(&self, metadata: QueueMetadata) -> IoWorker {
            IoWorker::new(
                "q",
                self.queue_dir.clone(),
                &self.env,
                self.shared.clone(),
                MetadataFile::new(&self.queue_dir),
                metadata,
            )
        }

        fn segment_len(&self, segment: u64) -> u64 {
            std::fs::metadata(segment_path(&self.queue_dir, segment))
                .unwrap()
                .len()
        }
    }

    #[test]
    fn test_write_rolls_after_reaching_limit() {
        let fixture = WorkerFixture::new(100);
        let mut worker = fixture.worker(QueueMetadata::default());
        let payload = Bytes::from(vec![b'x'; 30]);

        let responses: Vec<_> = (0..5)
            .map(|_| worker.write_one(&payload).unwrap())
            .collect();

        assert_eq!(responses[2], WriteResponse { segment: 1, position: 0 });
        assert_eq!(responses[4], WriteResponse { segment: 1, position: 68 });
        assert_eq!(fixture.segment_len(0), 102);
        assert_eq!(fixture.segment_len(1), 68);
        assert_eq!(worker.depth, 5);
        assert_eq!(fixture.shared.write_offset().segment, 1);
        assert_eq!(fixture.shared.write_offset().position, 68);

        let persisted = MetadataFile::new(&fixture.queue_dir).read().unwrap().unwrap();
        assert_eq!(persisted.write_segment, 1);
    }

    #[test_case(0; "empty")]
    #[test_case(64; "too large")]
    fn test_write_rejects_size_before_io(size: usize) {
        let fixture = WorkerFixture::new(100);
        let mut worker = fixture.worker(QueueMetadata::default());
        let config = DiskQueueConfig {
            max_msg_size: 63,
            ..DiskQueueConfig::default()
        };
        worker.config = Arc::new(config);

        let result = worker.write_one(&Bytes::from(vec![0u8; size]));
        assert!(matches!(result, Err(crate::QueueError::InvalidMessageSize { .. })));
        assert!(!segment_path(&fixture.queue_dir, 0).exists());
    }

    #[test]
    fn test_tail_check_heals_reader_ahead_of_writer() {
        let fixture = WorkerFixture::new(100);
        let worker = fixture.worker(QueueMetadata {
            depth:          7,
            read_segment:   3,
            read_position:  0,
            write_segment:  1,
            write_position: 50,
        });

        assert_eq!(worker.depth, 0);
        assert_eq!(worker.write_segment, 2);
        assert_eq!(worker.write_position, 0);
        assert_eq!((worker.read_segment, worker.read_position), (2, 0));
        assert!(worker.need_sync);
    }

    #[test]
    fn test_tail_check_resets_depth_when_drained() {
        let fixture = WorkerFixture::new(100);
        let worker = fixture.worker(QueueMetadata {
            depth: -3,
            read_segment: 1,
            read_position: 40,
            write_segment: 1,
            write_position: 40,
        });
        assert_eq!(worker.depth, 0);
        assert_eq!(worker.write_segment, 1);
    }

    #[test]
    fn test_channel_reader_walks_segments_and_deletes_drained() {
        let fixture = WorkerFixture::new(100);
        fixture.shared.set_consumer_mode(false);
        let mut worker = fixture.worker(QueueMetadata::default());
        for i in 0..4u8 {
            worker.write_one(&Bytes::from(vec![i; 30])).unwrap();
        }

        for i in 0..4u8 {
            assert!(worker.has_unread());
            let data = worker.read_one().unwrap().unwrap();
            assert_eq!(data, Bytes::from(vec![i; 30]));
            worker.read_move_forward();
        }

        assert!(!worker.has_unread());
        assert_eq!(worker.depth, 0);
        assert!(!segment_path(&fixture.queue_dir, 0).exists());
    }

    #[test]
    fn test_read_error_moves_segment_aside() {
        let fixture = WorkerFixture::new(1000);
        fixture.shared.set_consumer_mode(false);
        let mut worker = fixture.worker(QueueMetadata::default());
        worker.write_one(&Bytes::from_static(b"hello")).unwrap();
        worker.sync().unwrap();

        std::fs::write(segment_path(&fixture.queue_dir, 0), [0u8, 0, 0, 0, 1, 2, 3, 4, 5]).unwrap();
        assert!(worker.read_one().is_err());
        worker.handle_read_error();

        assert!(bad_path(&segment_path(&fixture.queue_dir, 0)).exists());
        assert_eq!(worker.read_segment, 1);
        assert_eq!(worker.write_segment, 1);
        assert!(!worker.has_unread());
    }

    #[test]
    fn test_run_loop_serves_requests_and_exits() {
        let fixture = WorkerFixture::new(1000);
        let worker = fixture.worker(QueueMetadata::default());

        let (write_tx, write_rx) = channel::bounded(0);
        let (control_tx, control_rx) = channel::bounded(0);
        let (exit_tx, exit_rx) = channel::bounded(1);
        let (read_tx, _read_rx) = channel::bounded(0);
        let handle = std::thread::spawn(move || {
            worker.run(WorkerChannels {
                write_rx,
                control_rx,
                exit_rx,
                read_tx,
            });
        });

        let (resp_tx, resp_rx) = channel::bounded(1);
        write_tx
            .send(WriteRequest {
                data: Bytes::from_static(b"abc"),
                resp: resp_tx,
            })
            .unwrap();
        let response = resp_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(response, WriteResponse { segment: 0, position: 7 });

        let (depth_tx, depth_rx) = channel::bounded(1);
        control_tx.send(Control::Depth(depth_tx)).unwrap();
        assert_eq!(depth_rx.recv().unwrap(), 1);

        exit_tx.send(true).unwrap();
        handle.join().unwrap();

        let persisted = MetadataFile::new(&fixture.queue_dir).read().unwrap().unwrap();
        assert_eq!(persisted.write_position, 7);
    }
}

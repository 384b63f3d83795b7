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

//! Consumer cursor for reading a segment log independently of other readers.
//!
//! A [`Consumer`] owns its own `(segment, position, version)` and file handle.
//! It never mutates log state: the only shared things it touches are the
//! published write offset (its upper read bound) and the reader registry used
//! by retention.
//!
//! ## Fetch state machine
//!
//! ```text
//!              frame ok / limit not hit
//!            ┌──────────────┐
//!            ▼              │
//!       ┌───────────┐ ──────┘           limit hit
//!  ───► │ ReadFrame │ ─────────────────────────────► Done
//!       └─────┬─────┘
//!   at bound  │  corrupt (auto skip)
//!             ▼                 ─────────────────────┐
//!      ┌─────────────┐  segment closed  ┌────────────▼───┐
//!      │ AwaitGrowth │ ───────────────► │ AdvanceSegment │ ──► ReadFrame
//!      └──────┬──────┘                  └────────────────┘
//!             │ nothing to read
//!             ▼
//!      Done (have messages) / Backoff (empty)
//! ```
//!
//! The read bound of the write segment is the published write position, so a
//! cursor never observes a half-written frame. Closed segments are bounded by
//! their file length.

use std::{
    fs::File,
    io::{BufReader, ErrorKind, Seek, SeekFrom},
    sync::Arc,
    thread,
};

use bytes::Bytes;
use snafu::ensure;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    ConsumerConfig, FetchContext, Message, Offset, QueueConfig, QueueError, Result,
    compression::decompress_message,
    error::{ExitingSnafu, OffsetOutOfRangeSnafu, SegmentNotFoundSnafu, ShuttingDownSnafu, TooManyRetriesSnafu},
    event::SegmentEventKind,
    io_worker::read_frame,
    message::message_disk_size,
    offset_store::OffsetStore,
    queue::SegmentLog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    ReadFrame,
    AwaitGrowth,
    AdvanceSegment,
    Backoff,
    Done,
}

enum FrameRead {
    Frame(Bytes),
    /// The frame is incomplete or runs past the known bound.
    Eof,
    Corrupt(QueueError),
}

/// Accumulated output and limits of one fetch.
struct FetchRun {
    messages:     Vec<Message>,
    bytes:        u64,
    max_messages: usize,
    max_bytes:    u64,
    retries:      u32,
}

impl FetchRun {
    fn is_full(&self) -> bool {
        self.messages.len() >= self.max_messages || (self.max_bytes > 0 && self.bytes > self.max_bytes)
    }
}

/// Independent read cursor of one consumer over one queue.
///
/// Not safe for concurrent use: one thread drives a cursor for its lifetime.
pub struct Consumer {
    /// Random id distinguishing cursors of the same consumer config.
    id:      String,
    log:     Arc<SegmentLog>,
    queue:   QueueConfig,
    config:  ConsumerConfig,
    /// Where `commit_offset` persists progress.
    offsets: Arc<OffsetStore>,

    /// Segment of the next frame to read.
    segment:        u64,
    /// Byte offset of the next frame in `segment`.
    position:       u64,
    /// Reset counter carried into every returned [`Offset`].
    version:        u64,
    /// Open handle of `segment`, dropped on advance and close.
    reader:         Option<BufReader<File>>,
    /// Bytes of the current segment that may be read.
    bound:          u64,
    /// Whether `bound` is the final size of the current segment.
    load_completed: bool,
    /// Set by `close`; later fetches fail with `Exiting`.
    closed:         bool,
}

impl Consumer {
    /// Opens a cursor at `start`. Switches the log to cursor mode.
    pub fn open(
        log: Arc<SegmentLog>,
        queue: QueueConfig,
        config: ConsumerConfig,
        offsets: Arc<OffsetStore>,
        start: Offset,
    ) -> Result<Self> {
        log.enable_consumer_mode();
        let mut consumer = Self {
            id: Uuid::new_v4().to_string(),
            log,
            queue,
            config,
            offsets,
            segment: start.segment,
            position: start.position,
            version: start.version,
            reader: None,
            bound: 0,
            load_completed: false,
            closed: false,
        };
        consumer.reset_offset(start)?;
        debug!(
            queue = %consumer.queue.id,
            consumer = %consumer.config.key(),
            id = %consumer.id,
            offset = %start,
            "Consumer acquired"
        );
        Ok(consumer)
    }

    pub fn id(&self) -> &str { &self.id }

    pub const fn config(&self) -> &ConsumerConfig { &self.config }

    pub const fn queue(&self) -> &QueueConfig { &self.queue }

    /// Where the next fetch starts.
    pub const fn offset(&self) -> Offset { Offset::with_version(self.segment, self.position, self.version) }

    /// Moves the cursor to `offset`, which must not lie past the write
    /// position.
    pub fn reset_offset(&mut self, offset: Offset) -> Result<()> {
        ensure!(!self.closed, ExitingSnafu { queue: &self.queue.id });
        let write = self.log.latest_offset();
        ensure!(
            (offset.segment, offset.position) <= (write.segment, write.position),
            OffsetOutOfRangeSnafu {
                segment:        offset.segment,
                position:       offset.position,
                write_segment:  write.segment,
                write_position: write.position,
            }
        );

        if offset.segment != self.segment {
            debug!(
                queue = %self.queue.id,
                from = %self.offset(),
                to = %offset,
                "Switching segment"
            );
        }
        self.segment = offset.segment;
        self.position = offset.position;
        self.version = offset.version;
        self.open_segment()
    }

    /// Reads up to `max_messages` messages (0 means the configured limit).
    ///
    /// Returns the messages and whether the fetch gave up empty after the
    /// EOF backoff. `ctx.next_offset` always ends at the cursor position.
    pub fn fetch_messages(&mut self, ctx: &mut FetchContext, max_messages: usize) -> Result<(Vec<Message>, bool)> {
        ensure!(!self.closed, ExitingSnafu { queue: &self.queue.id });
        ctx.init_offset = self.offset();
        ctx.next_offset = self.offset();

        let mut run = FetchRun {
            messages:     Vec::new(),
            bytes:        0,
            max_messages: self.message_limit(max_messages),
            max_bytes:    u64::try_from(self.config.fetch_max_bytes).unwrap_or(u64::MAX),
            retries:      0,
        };
        let mut state = FetchState::ReadFrame;

        loop {
            if self.log.env().is_shutting_down() {
                ensure!(!run.messages.is_empty(), ShuttingDownSnafu);
                state = FetchState::Done;
            }

            trace!(queue = %self.queue.id, ?state, offset = %self.offset(), "Fetch step");
            state = match state {
                FetchState::ReadFrame => self.read_frame_step(ctx, &mut run)?,
                FetchState::AwaitGrowth => self.await_growth(&run)?,
                FetchState::AdvanceSegment => self.advance_segment()?,
                FetchState::Backoff => {
                    thread::sleep(self.config.eof_retry_delay());
                    return Ok((run.messages, true));
                }
                FetchState::Done => return Ok((run.messages, false)),
            };
            ctx.next_offset = self.offset();
        }
    }

    /// Stores `offset` as this consumer's committed progress.
    pub fn commit_offset(&self, offset: Offset) -> Result<()> {
        self.offsets
            .commit_offset(&self.queue, &self.config, offset)
    }

    /// Releases the file handle and deregisters from the log.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader = None;
        self.log.remove_reader(&self.id);
        debug!(queue = %self.queue.id, id = %self.id, offset = %self.offset(), "Consumer closed");
    }

    fn message_limit(&self, requested: usize) -> usize {
        match (requested, self.config.fetch_max_messages) {
            (0, 0) => usize::MAX,
            (0, configured) => configured,
            (requested, 0) => requested,
            (requested, configured) => requested.min(configured),
        }
    }

    /// Opens the current segment, skipping missing closed segments when
    /// allowed. A missing write segment is not an error: the writer creates
    /// it lazily.
    fn open_segment(&mut self) -> Result<()> {
        self.reader = None;
        let config = self.log.env().config.clone();
        loop {
            let write = self.log.latest_offset();
            let (path, exists) = self
                .log
                .env()
                .resolver
                .resolve(self.log.name(), self.segment);

            if exists {
                let mut file = File::open(&path)?;
                let len = file.metadata()?.len();
                self.load_completed = self.segment < write.segment;
                self.bound = if self.load_completed {
                    len
                } else {
                    write.position.min(len)
                };
                if self.position > 0 {
                    file.seek(SeekFrom::Start(self.position))?;
                }
                self.reader = Some(BufReader::new(file));
                break;
            }

            if self.segment >= write.segment {
                self.load_completed = false;
                self.bound = self.position;
                break;
            }

            ensure!(config.auto_skip_corrupted_file, SegmentNotFoundSnafu { path });
            warn!(queue = %self.queue.id, segment = self.segment, "Segment missing, skipping to next");
            self.segment += 1;
            self.position = 0;
        }

        self.log.update_reader(&self.id, self.segment);
        Ok(())
    }

    fn read_frame_step(&mut self, ctx: &mut FetchContext, run: &mut FetchRun) -> Result<FetchState> {
        if self.reader.is_none() {
            self.open_segment()?;
        }
        if self.position >= self.bound {
            return Ok(FetchState::AwaitGrowth);
        }

        match self.read_next()? {
            FrameRead::Frame(payload) => {
                run.retries = 0;
                let size = message_disk_size(payload.len());
                let offset = self.offset();

                let data = if self.log.env().config.compress.message.enabled {
                    match decompress_message(&payload) {
                        Ok(data) => data,
                        Err(e) if run.messages.is_empty() => {
                            warn!(queue = %self.queue.id, offset = %offset, error = ?e, "Skipping undecodable message");
                            self.position += size;
                            ctx.next_offset = self.offset();
                            return Err(e);
                        }
                        Err(_) => {
                            // Report the bad frame on the next fetch.
                            self.reader = None;
                            return Ok(FetchState::Done);
                        }
                    }
                } else {
                    payload
                };

                self.position += size;
                run.bytes += size;
                run.messages.push(Message {
                    data,
                    size,
                    offset,
                    next_offset: self.offset(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                ctx.message_count += 1;

                Ok(if run.is_full() {
                    FetchState::Done
                } else {
                    FetchState::ReadFrame
                })
            }
            FrameRead::Eof => {
                self.reader = None;
                if self.load_completed {
                    let error = std::io::Error::new(ErrorKind::UnexpectedEof, "truncated frame in closed segment");
                    return self.skip_corrupted(error.into());
                }

                run.retries += 1;
                ensure!(
                    run.retries <= self.config.eof_max_retry_times,
                    TooManyRetriesSnafu { times: run.retries }
                );
                thread::sleep(self.config.eof_retry_delay());
                Ok(FetchState::ReadFrame)
            }
            FrameRead::Corrupt(error) => {
                self.reader = None;
                self.skip_corrupted(error)
            }
        }
    }

    fn read_next(&mut self) -> Result<FrameRead> {
        let config = self.log.env().config.clone();
        let Some(reader) = self.reader.as_mut() else {
            return Ok(FrameRead::Eof);
        };
        match read_frame(reader, &config) {
            Ok(payload) if self.position + message_disk_size(payload.len()) > self.bound => Ok(FrameRead::Eof),
            Ok(payload) => Ok(FrameRead::Frame(payload)),
            Err(e @ QueueError::InvalidMessageSize { .. }) => Ok(FrameRead::Corrupt(e)),
            Err(QueueError::Io { ref source, .. }) if source.kind() == ErrorKind::UnexpectedEof => Ok(FrameRead::Eof),
            Err(e) => Err(e),
        }
    }

    /// Gives up on the rest of the current segment, or fails when skipping
    /// is disabled.
    fn skip_corrupted(&mut self, error: QueueError) -> Result<FetchState> {
        if !self.log.env().config.auto_skip_corrupted_file {
            return Err(error);
        }
        warn!(
            queue = %self.queue.id,
            segment = self.segment,
            position = self.position,
            error = %error,
            "Corrupted segment, skipping to next"
        );
        if self.segment >= self.log.latest_offset().segment {
            self.log.skip_to_next_writable()?;
        }
        Ok(FetchState::AdvanceSegment)
    }

    /// Re-measures the bound once the cursor reached it.
    fn await_growth(&mut self, run: &FetchRun) -> Result<FetchState> {
        let write = self.log.latest_offset();

        if self.segment < write.segment {
            if self.reader.is_none() {
                self.open_segment()?;
            } else if !self.load_completed
                && let Some(reader) = self.reader.as_ref()
            {
                self.bound = reader.get_ref().metadata()?.len();
                self.load_completed = true;
            }
            if self.position < self.bound {
                return Ok(FetchState::ReadFrame);
            }
            if self.segment < write.segment {
                return Ok(FetchState::AdvanceSegment);
            }
        }

        if write.position > self.position {
            if self.reader.is_none() {
                self.open_segment()?;
            } else {
                self.bound = write.position;
            }
            if self.position < self.bound {
                return Ok(FetchState::ReadFrame);
            }
        }

        Ok(if run.messages.is_empty() {
            FetchState::Backoff
        } else {
            FetchState::Done
        })
    }

    fn advance_segment(&mut self) -> Result<FetchState> {
        let finished = self.segment;
        self.log
            .env()
            .notifier
            .notify(self.log.name(), SegmentEventKind::ReadComplete, finished);

        self.segment += 1;
        self.position = 0;
        self.open_segment()?;
        debug!(queue = %self.queue.id, finished, segment = self.segment, "Consumer advanced segment");
        Ok(FetchState::ReadFrame)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) { self.close(); }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::atomic::Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        DiskQueueConfig, MemoryKvStore,
        event::SegmentEvent,
        path::segment_path,
        queue::QueueEnv,
    };

    struct Fixture {
        _temp_dir: TempDir,
        env:       QueueEnv,
        log:       Arc<SegmentLog>,
        offsets:   Arc<OffsetStore>,
    }

    impl Fixture {
        fn new(config: DiskQueueConfig) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let env = QueueEnv::new(temp_dir.path(), config, None);
            let log = Arc::new(SegmentLog::open("orders", &env, true).unwrap());
            Self {
                _temp_dir: temp_dir,
                env,
                log,
                offsets: Arc::new(OffsetStore::new(Arc::new(MemoryKvStore::new()))),
            }
        }

        fn small() -> Self {
            Self::new(DiskQueueConfig {
                max_bytes_per_file: 100,
                ..DiskQueueConfig::default()
            })
        }

        fn consumer(&self, start: Offset) -> Consumer {
            let config = ConsumerConfig {
                eof_retry_delay_in_ms: 10,
                ..ConsumerConfig::new("orders", "indexer", "node-1")
            };
            Consumer::open(
                self.log.clone(),
                QueueConfig::new("orders"),
                config,
                self.offsets.clone(),
                start,
            )
            .unwrap()
        }

        fn put_all(&self, count: u8) {
            for i in 0..count {
                self.log.put(vec![i; 30]).unwrap();
            }
        }
    }

    fn payloads(messages: &[Message]) -> Vec<u8> { messages.iter().map(|m| m.data[0]).collect() }

    #[test]
    fn test_fetch_spans_segments() {
        let fixture = Fixture::small();
        fixture.put_all(5);
        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();

        let (messages, timed_out) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert!(!timed_out);
        assert_eq!(payloads(&messages), vec![0, 1, 2, 3, 4]);
        assert_eq!(messages[2].offset, Offset::new(0, 68));
        assert_eq!(messages[2].next_offset, Offset::new(0, 102));
        assert_eq!(messages[3].offset, Offset::new(1, 0));
        assert_eq!(messages[0].size, 34);
        assert_eq!(ctx.init_offset, Offset::new(0, 0));
        assert_eq!(ctx.next_offset, Offset::new(1, 68));
        assert_eq!(ctx.message_count, 5);
    }

    #[test]
    fn test_fetch_honors_limits() {
        let fixture = Fixture::small();
        fixture.put_all(5);
        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();

        let (messages, _) = consumer.fetch_messages(&mut ctx, 2).unwrap();
        assert_eq!(payloads(&messages), vec![0, 1]);
        assert_eq!(consumer.offset(), Offset::new(0, 68));

        let (messages, _) = consumer.fetch_messages(&mut ctx, 0).unwrap();
        assert_eq!(payloads(&messages), vec![2, 3, 4]);
    }

    #[test]
    fn test_empty_fetch_backs_off() {
        let fixture = Fixture::small();
        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();

        let (messages, timed_out) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert!(messages.is_empty());
        assert!(timed_out);

        fixture.put_all(1);
        let (messages, timed_out) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!timed_out);
    }

    #[test]
    fn test_follows_writer_after_roll() {
        let fixture = Fixture::small();
        fixture.put_all(2);
        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();
        assert_eq!(consumer.fetch_messages(&mut ctx, 10).unwrap().0.len(), 2);

        fixture.put_all(3);
        let (messages, _) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert_eq!(payloads(&messages), vec![0, 1, 2]);
        assert_eq!(messages[0].offset, Offset::new(0, 68));
        assert_eq!(consumer.offset(), Offset::new(1, 68));
    }

    #[test]
    fn test_reset_beyond_write_position_fails() {
        let fixture = Fixture::small();
        fixture.put_all(1);
        let mut consumer = fixture.consumer(Offset::default());
        let err = consumer.reset_offset(Offset::new(3, 0)).unwrap_err();
        assert!(matches!(err, QueueError::OffsetOutOfRange { write_segment: 0, write_position: 34, .. }));
        consumer.reset_offset(Offset::new(0, 34)).unwrap();
    }

    fn corrupt_length(fixture: &Fixture, segment: u64, position: u64) {
        let path = segment_path(fixture.log.queue_dir(), segment);
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(position)).unwrap();
        file.write_all(&0u32.to_be_bytes()).unwrap();
    }

    #[test]
    fn test_corrupt_frame_skips_to_next_segment() {
        let fixture = Fixture::small();
        let events = fixture.env.notifier.attach(16);
        fixture.put_all(5);
        corrupt_length(&fixture, 0, 34);

        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();
        let (messages, _) = consumer.fetch_messages(&mut ctx, 10).unwrap();

        assert_eq!(payloads(&messages), vec![0, 3, 4]);
        let read_complete: Vec<SegmentEvent> = events
            .try_iter()
            .filter(|e| e.kind == SegmentEventKind::ReadComplete)
            .collect();
        assert_eq!(read_complete.len(), 1);
        assert_eq!(read_complete[0].segment, 0);
    }

    #[test]
    fn test_corrupt_frame_fails_without_auto_skip() {
        let fixture = Fixture::new(DiskQueueConfig {
            max_bytes_per_file: 100,
            auto_skip_corrupted_file: false,
            ..DiskQueueConfig::default()
        });
        fixture.put_all(5);
        corrupt_length(&fixture, 0, 0);

        let mut consumer = fixture.consumer(Offset::default());
        let err = consumer
            .fetch_messages(&mut FetchContext::default(), 10)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidMessageSize { size: 0, .. }));
    }

    #[test]
    fn test_corrupt_write_segment_moves_writer() {
        let fixture = Fixture::small();
        fixture.put_all(2);
        corrupt_length(&fixture, 0, 34);

        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();
        let (messages, _) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert_eq!(payloads(&messages), vec![0]);
        assert_eq!(fixture.log.latest_offset(), Offset::new(1, 0));

        fixture.log.put(vec![9u8; 30]).unwrap();
        let (messages, _) = consumer.fetch_messages(&mut ctx, 10).unwrap();
        assert_eq!(payloads(&messages), vec![9]);
    }

    #[test]
    fn test_missing_closed_segment_is_skipped() {
        let fixture = Fixture::small();
        fixture.put_all(7);
        std::fs::remove_file(segment_path(fixture.log.queue_dir(), 0)).unwrap();

        let mut consumer = fixture.consumer(Offset::default());
        assert_eq!(consumer.offset(), Offset::new(1, 0));
        let (messages, _) = consumer
            .fetch_messages(&mut FetchContext::default(), 10)
            .unwrap();
        assert_eq!(payloads(&messages), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_compressed_messages_round_trip() {
        let mut config = DiskQueueConfig::default();
        config.compress.message.enabled = true;
        let fixture = Fixture::new(config);
        fixture.log.put(vec![b'z'; 4096]).unwrap();

        let mut consumer = fixture.consumer(Offset::default());
        let (messages, _) = consumer
            .fetch_messages(&mut FetchContext::default(), 10)
            .unwrap();
        assert_eq!(messages[0].data, Bytes::from(vec![b'z'; 4096]));
        assert!(messages[0].size < 4096);
    }

    #[test]
    fn test_shutdown_aborts_fetch() {
        let fixture = Fixture::small();
        let mut consumer = fixture.consumer(Offset::default());
        fixture.env.shutdown.store(true, Ordering::Release);
        let err = consumer
            .fetch_messages(&mut FetchContext::default(), 10)
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }

    #[test]
    fn test_reader_registration() {
        let fixture = Fixture::small();
        fixture.put_all(4);
        {
            let mut consumer = fixture.consumer(Offset::new(1, 0));
            assert_eq!(fixture.log.earliest_reader_segment(), Some(1));
            consumer.reset_offset(Offset::new(0, 0)).unwrap();
            assert_eq!(fixture.log.earliest_reader_segment(), Some(0));
        }
        assert_eq!(fixture.log.earliest_reader_segment(), None);
        assert!(fixture.log.is_consumer_mode());
    }

    #[test]
    fn test_commit_goes_to_offset_store() {
        let fixture = Fixture::small();
        fixture.put_all(2);
        let mut consumer = fixture.consumer(Offset::default());
        let mut ctx = FetchContext::default();
        consumer.fetch_messages(&mut ctx, 10).unwrap();
        consumer.commit_offset(ctx.next_offset).unwrap();

        let stored = fixture
            .offsets
            .get_offset(consumer.queue(), consumer.config())
            .unwrap();
        assert_eq!(stored, Offset::new(0, 68));
    }
}

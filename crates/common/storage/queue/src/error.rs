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

use std::{path::PathBuf, time::Duration};

use snafu::{Location, Snafu};

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(transparent)]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// The writer did not accept or acknowledge a write in time.
    #[snafu(display("Write to queue {queue} timed out after {timeout:?}"))]
    WriteTimeout { queue: String, timeout: Duration },

    /// Disk capacity limits tripped the readonly guard.
    #[snafu(display("Queue {queue} is readonly"))]
    ReadOnly { queue: String },

    /// The queue is closing or already closed.
    #[snafu(display("Queue {queue} is exiting"))]
    Exiting { queue: String },

    #[snafu(display("Invalid message size {size}, must be between {min} and {max}"))]
    InvalidMessageSize { size: usize, min: usize, max: usize },

    #[snafu(display("Segment file {} not found", path.display()))]
    SegmentNotFound { path: PathBuf },

    /// A cursor offset lies beyond the current write position.
    #[snafu(display(
        "Offset {segment},{position} is beyond write position {write_segment},{write_position}"
    ))]
    OffsetOutOfRange {
        segment:        u64,
        position:       u64,
        write_segment:  u64,
        write_position: u64,
    },

    /// A cursor reopened a growing segment too many times in one fetch.
    #[snafu(display("Retried {times} times waiting for segment to grow"))]
    TooManyRetries { times: u32 },

    #[snafu(display("Queue module is shutting down"))]
    ShuttingDown,

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    #[snafu(display("Invalid offset string {raw:?}"))]
    InvalidOffset { raw: String },

    #[snafu(display("Queue metadata corrupted: {reason}"))]
    MetadataCorrupted { reason: String },

    /// zstd encode or decode failure.
    #[snafu(display("Compression failed: {source}"))]
    Compression { source: std::io::Error },

    #[snafu(display("Cold tier failure: {message}"))]
    ColdTier { message: String },

    #[snafu(display("KV store failure: {message}"))]
    KvStore { message: String },

    #[snafu(display("Disk capacity exceeded: {message}"))]
    CapacityExceeded { message: String },

    /// Failed to send a request to the IO worker.
    #[snafu(display("Channel send error"))]
    ChannelSend,

    /// Failed to receive a response from the IO worker.
    #[snafu(display("Channel receive error"))]
    ChannelRecv,

    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

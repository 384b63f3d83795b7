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

//! Message types and on-disk frame format.
//!
//! ## On-Disk Frame Format
//!
//! Segments hold frames back to back, with no segment header:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┐
//! │  Length (4B)    │   Payload (variable) │
//! │  big-endian     │   raw bytes          │
//! └─────────────────┴──────────────────────┘
//! ```
//!
//! The length must lie in `[min_msg_size, max_msg_size]`. A reader that finds
//! a length outside that range treats the rest of the segment as corrupt.
//! When per-message compression is enabled the payload is the zstd encoding
//! of the producer's bytes.

use bytes::{BufMut, Bytes};
use crossbeam::channel::Sender;
use snafu::ensure;

use crate::{DiskQueueConfig, Offset, Result, error::InvalidMessageSizeSnafu};

/// Size of the length prefix in bytes.
pub(crate) const MESSAGE_LENGTH_SIZE: usize = 4;

/// A message returned by a [`Consumer`](crate::Consumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Decoded payload.
    pub data:        Bytes,
    /// Bytes the frame occupies on disk, prefix included.
    pub size:        u64,
    /// Where the frame starts.
    pub offset:      Offset,
    /// Where the frame after this one starts.
    pub next_offset: Offset,
    /// Unix milliseconds at which the message was read.
    pub timestamp:   i64,
}

/// Position the writer reached after a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub segment:  u64,
    pub position: u64,
}

impl WriteResponse {
    pub const fn offset(&self) -> Offset { Offset::new(self.segment, self.position) }
}

/// Internal request sent from a [`SegmentLog`](crate::SegmentLog) handle to
/// the IO worker. The worker answers on `resp`.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub data: Bytes,
    pub resp: Sender<Result<WriteResponse>>,
}

/// Total on-disk size of a frame carrying `payload_len` bytes.
#[inline]
pub(crate) const fn message_disk_size(payload_len: usize) -> u64 {
    (MESSAGE_LENGTH_SIZE + payload_len) as u64
}

/// Rejects payload sizes outside the configured bounds.
pub(crate) fn check_message_size(size: usize, config: &DiskQueueConfig) -> Result<()> {
    ensure!(
        size >= config.min_msg_size && size <= config.max_msg_size,
        InvalidMessageSizeSnafu {
            size,
            min: config.min_msg_size,
            max: config.max_msg_size,
        }
    );
    Ok(())
}

/// Appends one frame to `buf`.
pub(crate) fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.reserve(MESSAGE_LENGTH_SIZE + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Whether a decoded length prefix is acceptable.
#[inline]
pub(crate) fn valid_frame_length(length: u32, config: &DiskQueueConfig) -> bool {
    let length = length as usize;
    length >= config.min_msg_size && length <= config.max_msg_size
}

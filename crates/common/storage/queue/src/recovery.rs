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

//! Crash recovery for a segment log.
//!
//! Recovery uses `meta.dat` for O(1) startup:
//! 1. Read metadata to get reader/writer state
//! 2. Scan only the write segment from the recorded write position, adopting
//!    frames written after the last sync
//! 3. Truncate a torn frame at the tail
//!
//! Unreadable metadata is rebuilt from the segment files on disk: writing
//! resumes on a fresh segment after the highest one found.

use std::{
    fs::{File, OpenOptions},
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use tracing::{debug, info, warn};

use crate::{
    DiskQueueConfig, QueueError, Result,
    message::{MESSAGE_LENGTH_SIZE, message_disk_size, valid_frame_length},
    metadata::{MetadataFile, QueueMetadata},
    path::{scan_segments, segment_path},
};

/// State recovered for a segment log.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RecoveryInfo {
    pub metadata:           QueueMetadata,
    /// Complete frames found past the persisted write position.
    pub recovered_messages: u64,
    /// Bytes cut from the tail of the write segment.
    pub truncated_bytes:    u64,
}

pub(crate) fn recover(
    queue_dir: &Path,
    metadata_file: &MetadataFile,
    config: &DiskQueueConfig,
) -> Result<RecoveryInfo> {
    let mut metadata = match metadata_file.read() {
        Ok(Some(metadata)) => metadata,
        Ok(None) => rebuild_from_segments(queue_dir)?,
        Err(QueueError::MetadataCorrupted { reason }) => {
            warn!(path = ?metadata_file.path(), reason, "Queue metadata corrupted, rebuilding from segments");
            rebuild_from_segments(queue_dir)?
        }
        Err(e) => return Err(e),
    };

    let write_path = segment_path(queue_dir, metadata.write_segment);
    let scan = scan_tail(&write_path, metadata.write_position, config)?;

    if scan.file_len < metadata.write_position {
        warn!(
            path = ?write_path,
            file_len = scan.file_len,
            write_position = metadata.write_position,
            "Write segment shorter than recorded write position"
        );
    }

    let recovered_messages = if scan.rescanned { 0 } else { scan.frames };
    let truncated_bytes = scan.file_len.saturating_sub(scan.end);

    if truncated_bytes > 0 {
        warn!(path = ?write_path, position = scan.end, truncated_bytes, "Truncating torn tail of write segment");
        let file = OpenOptions::new().write(true).open(&write_path)?;
        file.set_len(scan.end)?;
        file.sync_all()?;
    }

    metadata.write_position = scan.end;
    #[allow(clippy::cast_possible_wrap)]
    {
        metadata.depth += recovered_messages as i64;
    }

    info!(
        queue_dir = ?queue_dir,
        read_segment = metadata.read_segment,
        read_position = metadata.read_position,
        write_segment = metadata.write_segment,
        write_position = metadata.write_position,
        depth = metadata.depth,
        recovered_messages,
        "Queue recovery complete"
    );

    Ok(RecoveryInfo {
        metadata,
        recovered_messages,
        truncated_bytes,
    })
}

fn rebuild_from_segments(queue_dir: &Path) -> Result<QueueMetadata> {
    let segments = scan_segments(queue_dir)?;
    let Some(&last) = segments.last() else {
        return Ok(QueueMetadata::default());
    };

    let next = last + 1;
    warn!(queue_dir = ?queue_dir, segments = segments.len(), next, "Resuming on a fresh segment without metadata");
    Ok(QueueMetadata {
        depth:          0,
        read_segment:   next,
        read_position:  0,
        write_segment:  next,
        write_position: 0,
    })
}

struct TailScan {
    frames:    u64,
    end:       u64,
    file_len:  u64,
    rescanned: bool,
}

/// Walks complete frames of `path` starting at `start`, or at 0 when the
/// file is shorter than `start`.
fn scan_tail(path: &Path, start: u64, config: &DiskQueueConfig) -> Result<TailScan> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(TailScan {
                frames:    0,
                end:       0,
                file_len:  0,
                rescanned: start > 0,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let file_len = file.metadata()?.len();
    let rescanned = file_len < start;
    let mut position = if rescanned { 0 } else { start };

    debug!(path = ?path, position, file_len, "Scanning write segment tail");

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(position))?;

    let mut frames = 0u64;
    let mut length_buf = [0u8; MESSAGE_LENGTH_SIZE];
    while position + MESSAGE_LENGTH_SIZE as u64 <= file_len {
        reader.read_exact(&mut length_buf)?;
        let length = u32::from_be_bytes(length_buf);

        if !valid_frame_length(length, config) {
            warn!(path = ?path, position, length, "Invalid frame length in write segment tail");
            break;
        }

        let total_size = message_disk_size(length as usize);
        if position + total_size > file_len {
            warn!(path = ?path, position, length, file_len, "Truncated frame found at end of segment");
            break;
        }

        reader.seek_relative(i64::from(length))?;
        position += total_size;
        frames += 1;
    }

    Ok(TailScan {
        frames,
        end: position,
        file_len,
        rescanned,
    })
}

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

//! Persisted reader/writer state of a segment log.
//!
//! `meta.dat` is a three line text file:
//!
//! ```text
//! <depth>
//! <read segment>,<read position>
//! <write segment>,<write position>
//! ```
//!
//! It is rewritten through a temporary file and an atomic rename, so a crash
//! leaves either the previous or the new content behind.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    Result,
    error::MetadataCorruptedSnafu,
    path::{metadata_path, remove_if_exists, with_suffix},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetadata {
    /// Unread messages in channel mode. Signed so corruption shows up as a
    /// negative value instead of wrapping.
    pub depth:          i64,
    pub read_segment:   u64,
    pub read_position:  u64,
    pub write_segment:  u64,
    pub write_position: u64,
}

impl QueueMetadata {
    pub fn serialize(&self) -> String {
        format!(
            "{}\n{},{}\n{},{}\n",
            self.depth, self.read_segment, self.read_position, self.write_segment, self.write_position
        )
    }

    pub fn deserialize(data: &str) -> Result<Self> {
        let mut lines = data.lines();

        let depth = lines
            .next()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .ok_or_else(|| corrupted("missing or invalid depth line"))?;
        let (read_segment, read_position) = parse_pair(lines.next(), "read")?;
        let (write_segment, write_position) = parse_pair(lines.next(), "write")?;

        Ok(Self {
            depth,
            read_segment,
            read_position,
            write_segment,
            write_position,
        })
    }
}

fn parse_pair(line: Option<&str>, which: &str) -> Result<(u64, u64)> {
    let line = line.ok_or_else(|| corrupted(format!("missing {which} line")))?;
    let (segment, position) = line
        .trim()
        .split_once(',')
        .ok_or_else(|| corrupted(format!("malformed {which} line {line:?}")))?;
    let segment = segment
        .parse()
        .map_err(|_| corrupted(format!("invalid {which} segment {segment:?}")))?;
    let position = position
        .parse()
        .map_err(|_| corrupted(format!("invalid {which} position {position:?}")))?;
    Ok((segment, position))
}

fn corrupted(reason: impl Into<String>) -> crate::QueueError {
    MetadataCorruptedSnafu {
        reason: reason.into(),
    }
    .build()
}

/// Reads and atomically rewrites `meta.dat` of one queue.
#[derive(Debug, Clone)]
pub(crate) struct MetadataFile {
    path: PathBuf,
}

impl MetadataFile {
    pub fn new<P: AsRef<Path>>(queue_dir: P) -> Self {
        Self {
            path: metadata_path(queue_dir),
        }
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Returns `None` when the queue has never persisted metadata.
    pub fn read(&self) -> Result<Option<QueueMetadata>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = std::str::from_utf8(&raw).map_err(|e| corrupted(format!("not valid UTF-8: {e}")))?;
        QueueMetadata::deserialize(data).map(Some)
    }

    pub fn write(&self, metadata: &QueueMetadata) -> Result<()> {
        let tmp_path = with_suffix(&self.path, ".tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(metadata.serialize().as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;

        debug!(path = ?self.path, ?metadata, "Queue metadata persisted");
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}

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

//! Positions inside a queue.
//!
//! An [`Offset`] names the first byte of a frame: the segment number and the
//! byte position inside that segment. The `version` counter is bumped when
//! an offset is reset, so a reset offset at `0,0` still orders after every
//! offset committed before the reset.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{
    Result,
    error::{InvalidOffsetSnafu, QueueError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub segment:  u64,
    pub position: u64,
    pub version:  u64,
}

impl Offset {
    pub const fn new(segment: u64, position: u64) -> Self {
        Self {
            segment,
            position,
            version: 0,
        }
    }

    pub const fn with_version(segment: u64, position: u64, version: u64) -> Self {
        Self {
            segment,
            position,
            version,
        }
    }

    /// Whether `self` is strictly later than `other`, comparing version
    /// first, then segment, then position.
    pub fn latest_than(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Greater }

    /// Same position ignoring the version.
    pub const fn same_position(&self, other: &Self) -> bool {
        self.segment == other.segment && self.position == other.position
    }

    /// Storage form `segment,position,version`.
    pub fn encode(&self) -> String {
        format!("{},{},{}", self.segment, self.position, self.version)
    }

    /// Parses `segment,position` or `segment,position,version`.
    pub fn decode(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split(',').collect();
        ensure!(
            parts.len() == 2 || parts.len() == 3,
            InvalidOffsetSnafu { raw }
        );

        let parse = |s: &str| -> Result<u64> {
            s.trim()
                .parse::<u64>()
                .map_err(|_| InvalidOffsetSnafu { raw }.build())
        };

        let segment = parse(parts[0])?;
        let position = parse(parts[1])?;
        let version = match parts.get(2) {
            Some(v) => parse(v)?,
            None => 0,
        };
        Ok(Self::with_version(segment, position, version))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.version, self.segment, self.position).cmp(&(
            other.version,
            other.segment,
            other.position,
        ))
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.segment, self.position)
    }
}

impl FromStr for Offset {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> { Self::decode(s) }
}

/// Per-fetch bookkeeping shared between a caller and a consumer.
///
/// `init_offset` is where the fetch started, `next_offset` where the next
/// one will start. `message_count` accumulates across fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchContext {
    pub message_count: u64,
    pub init_offset:   Offset,
    pub next_offset:   Offset,
}

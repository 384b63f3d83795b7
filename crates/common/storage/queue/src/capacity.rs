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

//! Disk capacity guard.
//!
//! The guard flips every queue of a module into readonly mode when the data
//! directory outgrows `max_used_bytes` or the filesystem's free space drops
//! below `reserved_free_bytes`. It is re-evaluated after segments close and
//! whenever a write is rejected, so queues recover once space is reclaimed.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use sysinfo::Disks;
use tracing::{error, info, warn};

use crate::{
    DiskQueueConfig, Result,
    error::{CapacityExceededSnafu, ReadOnlySnafu},
    path::dir_size,
    throttle::LogThrottle,
};

#[derive(Debug)]
pub struct CapacityGuard {
    data_dir:            PathBuf,
    max_used_bytes:      u64,
    warning_free_bytes:  u64,
    reserved_free_bytes: u64,
    readonly:            AtomicBool,
    throttle:            LogThrottle,
}

impl CapacityGuard {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &DiskQueueConfig) -> Self {
        Self {
            data_dir:            data_dir.as_ref().to_path_buf(),
            max_used_bytes:      config.max_used_bytes,
            warning_free_bytes:  config.warning_free_bytes,
            reserved_free_bytes: config.reserved_free_bytes,
            readonly:            AtomicBool::new(false),
            throttle:            LogThrottle::default(),
        }
    }

    pub fn is_readonly(&self) -> bool { self.readonly.load(Ordering::Acquire) }

    /// Re-evaluates the limits and updates the readonly flag.
    pub fn check(&self) -> Result<()> {
        let verdict = self.evaluate();
        let readonly = verdict.is_err();
        let was = self.readonly.swap(readonly, Ordering::AcqRel);
        if was != readonly {
            if readonly {
                error!(data_dir = ?self.data_dir, "Disk capacity exhausted, queues are readonly");
            } else {
                info!(data_dir = ?self.data_dir, "Disk capacity recovered, queues are writable");
            }
        }
        verdict
    }

    /// Builds the error for a write rejected while readonly, logging it at
    /// most once per second per queue.
    pub(crate) fn reject_write(&self, queue: &str) -> crate::QueueError {
        let reason = self.check().err();
        if self.throttle.allow("readonly", queue) {
            error!(queue, reason = ?reason, "Rejecting write on readonly queue");
        }
        ReadOnlySnafu { queue }.build()
    }

    fn evaluate(&self) -> Result<()> {
        if self.max_used_bytes > 0 {
            let used = dir_size(&self.data_dir)?;
            if used >= self.max_used_bytes {
                return CapacityExceededSnafu {
                    message: format!("used {used} bytes, limit {}", self.max_used_bytes),
                }
                .fail();
            }
        }

        if let Some(free) = self.free_bytes() {
            if free < self.reserved_free_bytes {
                return CapacityExceededSnafu {
                    message: format!("{free} bytes free, reserved {}", self.reserved_free_bytes),
                }
                .fail();
            }
            if free < self.warning_free_bytes && self.throttle.allow("low-space", "") {
                warn!(free, warning = self.warning_free_bytes, "Disk free space is low");
            }
        }
        Ok(())
    }

    /// Free bytes on the filesystem holding the data directory.
    fn free_bytes(&self) -> Option<u64> {
        let dir = self
            .data_dir
            .canonicalize()
            .unwrap_or_else(|_| self.data_dir.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
    }
}

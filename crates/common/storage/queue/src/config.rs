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

//! Configuration for the disk queue module, individual queues and consumers.
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file only
//! needs to name the settings it overrides.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Module-wide configuration shared by every queue of a [`DiskQueueModule`].
///
/// [`DiskQueueModule`]: crate::DiskQueueModule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct DiskQueueConfig {
    /// Smallest accepted payload in bytes.
    #[default = 1]
    #[builder(default = 1)]
    pub min_msg_size: usize,

    /// Largest accepted payload in bytes.
    #[default(_code = "100 * 1024 * 1024")]
    #[builder(default = 100 * 1024 * 1024)]
    pub max_msg_size: usize,

    /// A segment is closed once its size reaches this many bytes.
    #[default(_code = "100 * MIB")]
    #[builder(default = 100 * MIB)]
    pub max_bytes_per_file: u64,

    /// Writes plus reads between two fsyncs.
    #[default = 1000]
    #[builder(default = 1000)]
    pub sync_every_records: u64,

    #[default = 1000]
    #[builder(default = 1000)]
    pub sync_timeout_in_ms: u64,

    /// Upper bound for a write to be accepted and acknowledged.
    #[default = 10_000]
    #[builder(default = 10_000)]
    pub write_timeout_in_ms: u64,

    /// Capacity of the segment event channel feeding the lifecycle manager.
    #[default = 100]
    #[builder(default = 100)]
    pub notify_chan_buffer_size: usize,

    #[default = 0]
    #[builder(default = 0)]
    pub read_chan_buffer_size: usize,

    #[default = 0]
    #[builder(default = 0)]
    pub write_chan_buffer_size: usize,

    /// Back-off applied by readers that reached the end of written data.
    #[default = 500]
    #[builder(default = 500)]
    pub eof_retry_delay_in_ms: u64,

    /// Bytes the data directory may occupy, `0` disables the check.
    #[default = 0]
    #[builder(default = 0)]
    pub max_used_bytes: u64,

    /// Free space under which a warning is logged.
    #[default(_code = "10 * GIB")]
    #[builder(default = 10 * GIB)]
    pub warning_free_bytes: u64,

    /// Free space under which the queues turn readonly.
    #[default(_code = "5 * GIB")]
    #[builder(default = 5 * GIB)]
    pub reserved_free_bytes: u64,

    /// Skip unreadable segments instead of failing the reader.
    #[default = true]
    #[builder(default = true)]
    pub auto_skip_corrupted_file: bool,

    /// Ship closed segments to the cold tier.
    #[default = false]
    #[builder(default = false)]
    pub upload_to_s3: bool,

    /// Pull missing segments back from the cold tier on read.
    #[default = false]
    #[builder(default = false)]
    pub always_download: bool,

    /// Decompress segments ahead of the slowest reader.
    #[default = true]
    #[builder(default = true)]
    pub prepare_files_to_read: bool,

    /// Delete all segments and metadata when a queue is initialized.
    #[default = false]
    #[builder(default = false)]
    pub cleanup_files_on_init: bool,

    /// Skip compression and upload for queues without consumers.
    #[default = false]
    #[builder(default = false)]
    pub skip_zero_consumers: bool,

    #[builder(default)]
    pub retention: RetentionConfig,

    #[builder(default)]
    pub compress: CompressConfig,

    #[builder(default)]
    pub cold_tier: ColdTierConfig,
}

impl DiskQueueConfig {
    pub const fn sync_timeout(&self) -> Duration { Duration::from_millis(self.sync_timeout_in_ms) }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_in_ms)
    }

    pub const fn eof_retry_delay(&self) -> Duration {
        Duration::from_millis(self.eof_retry_delay_in_ms)
    }
}

/// How many closed segments stay on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct RetentionConfig {
    #[default = 5]
    #[builder(default = 5)]
    pub max_num_of_local_files: u64,
}

/// Segment and per-message compression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct CompressConfig {
    /// Distance in segments a closed segment must keep from the write and
    /// read frontier before it is compressed.
    #[default = 3]
    #[builder(default = 3)]
    pub idle_threshold: u64,

    #[default = true]
    #[builder(default = true)]
    pub delete_after_compress: bool,

    /// Segments decompressed ahead of a reader.
    #[default = 3]
    #[builder(default = 3)]
    pub num_of_files_decompress_ahead: u64,

    #[default(_code = "CompressLevel { enabled: false, level: 3 }")]
    #[builder(default = CompressLevel { enabled: false, level: 3 })]
    pub message: CompressLevel,

    #[default(_code = "CompressLevel { enabled: true, level: 11 }")]
    #[builder(default = CompressLevel { enabled: true, level: 11 })]
    pub segment: CompressLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressLevel {
    pub enabled: bool,
    pub level:   i32,
}

/// Cold tier destination for uploaded segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, bon::Builder)]
#[serde(default)]
#[builder(on(String, into))]
pub struct ColdTierConfig {
    #[builder(default)]
    pub async_upload: bool,
    #[builder(default)]
    pub server:       String,
    #[builder(default)]
    pub location:     String,
    #[builder(default)]
    pub bucket:       String,
    /// Prepended to every object name.
    #[builder(default)]
    pub prefix:       String,
}

impl ColdTierConfig {
    pub fn is_configured(&self) -> bool { !self.bucket.is_empty() }
}

/// Identity of a single queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub id:     String,
    pub name:   String,
    pub labels: HashMap<String, String>,
}

impl QueueConfig {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            labels: HashMap::new(),
        }
    }
}

/// Identity and fetch limits of a consumer group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
#[builder(on(String, into))]
pub struct ConsumerConfig {
    #[builder(default)]
    pub id: String,

    #[builder(default)]
    pub group: String,

    #[builder(default)]
    pub name: String,

    /// Advisory lower bound callers may batch up to before processing.
    #[default = 1]
    #[builder(default = 1)]
    pub fetch_min_bytes: usize,

    /// Advisory upper bound callers may wait for `fetch_min_bytes`.
    #[default = 10_000]
    #[builder(default = 10_000)]
    pub fetch_max_wait_ms: u64,

    /// Upper bound of payload bytes returned by one fetch.
    #[default(_code = "20 * 1024 * 1024")]
    #[builder(default = 20 * 1024 * 1024)]
    pub fetch_max_bytes: usize,

    /// Upper bound of messages returned by one fetch.
    #[default = 500]
    #[builder(default = 500)]
    pub fetch_max_messages: usize,

    /// Reopens of a growing segment allowed within a single fetch.
    #[default = 10]
    #[builder(default = 10)]
    pub eof_max_retry_times: u32,

    #[default = 500]
    #[builder(default = 500)]
    pub eof_retry_delay_in_ms: u64,
}

impl ConsumerConfig {
    pub fn new(queue_id: &str, group: impl Into<String>, name: impl Into<String>) -> Self {
        let group = group.into();
        let name = name.into();
        Self {
            id: format!("{queue_id}-{group}-{name}"),
            group,
            name,
            ..Self::default()
        }
    }

    /// Key under which offsets of this consumer are committed.
    pub fn key(&self) -> String { format!("{}-{}", self.group, self.name) }

    pub const fn eof_retry_delay(&self) -> Duration {
        Duration::from_millis(self.eof_retry_delay_in_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_defaults() {
        let config = DiskQueueConfig::default();
        assert_eq!(config.min_msg_size, 1);
        assert_eq!(config.max_msg_size, 100 * 1024 * 1024);
        assert_eq!(config.max_bytes_per_file, 100 * MIB);
        assert_eq!(config.sync_every_records, 1000);
        assert_eq!(config.sync_timeout(), Duration::from_secs(1));
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.notify_chan_buffer_size, 100);
        assert_eq!(config.warning_free_bytes, 10 * GIB);
        assert_eq!(config.reserved_free_bytes, 5 * GIB);
        assert!(config.auto_skip_corrupted_file);
        assert!(!config.upload_to_s3);
        assert!(config.prepare_files_to_read);
        assert_eq!(config.retention.max_num_of_local_files, 5);
        assert_eq!(config.compress.idle_threshold, 3);
        assert!(config.compress.segment.enabled);
        assert_eq!(config.compress.segment.level, 11);
        assert!(!config.compress.message.enabled);
    }

    #[test]
    fn test_builder_matches_default() {
        let built = DiskQueueConfig::builder().build();
        assert_eq!(built, DiskQueueConfig::default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: DiskQueueConfig =
            serde_json::from_str(r#"{"max_bytes_per_file": 4096, "retention": {}}"#).unwrap();
        assert_eq!(config.max_bytes_per_file, 4096);
        assert_eq!(config.retention.max_num_of_local_files, 5);
        assert_eq!(config.sync_every_records, 1000);
    }

    #[test]
    fn test_consumer_key() {
        let consumer = ConsumerConfig::new("orders", "billing", "worker-1");
        assert_eq!(consumer.key(), "billing-worker-1");
        assert_eq!(consumer.id, "orders-billing-worker-1");
        assert_eq!(consumer.fetch_max_messages, 500);
        assert_eq!(consumer.eof_retry_delay(), Duration::from_millis(500));
    }
}

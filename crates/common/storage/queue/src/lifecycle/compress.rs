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

//! Segment compression and read-ahead decompression.

use tracing::{debug, error, trace};

use super::SegmentLifecycle;
use crate::{
    compression::compress_file,
    kv::{LAST_COMPRESSED_BUCKET, segment_mark, set_segment_mark},
    path::{compressed_path, remove_if_exists, segment_path},
};

impl SegmentLifecycle {
    /// Compresses segments idle for at least `idle_threshold` closes and
    /// behind every consumer, advancing the compressed mark.
    pub(super) fn compress_segments(&self, queue: &str, closed: u64) {
        if !self.config.compress.segment.enabled {
            trace!(queue, "Segment compression disabled");
            return;
        }

        let consumers = self.progress.consumer_count(queue);
        if self.config.skip_zero_consumers && consumers == 0 {
            debug!(queue, "No consumers, skipping compression");
            return;
        }

        let threshold = self.config.compress.idle_threshold;
        let Some(mut end) = closed.checked_sub(threshold) else {
            return;
        };
        if consumers > 0 {
            match self.progress.earliest_segment(queue) {
                Some(earliest) if earliest > 0 => end = end.min(earliest - 1),
                _ => return,
            }
        }

        let last = match segment_mark(self.kv.as_ref(), LAST_COMPRESSED_BUCKET, queue) {
            Ok(last) => last,
            Err(e) => {
                error!(queue, error = ?e, "Failed to read compressed mark");
                return;
            }
        };
        let start = last.map_or(0, |last| last + 1);
        if start > end {
            return;
        }

        debug!(queue, start, end, consumers, "Compressing idle segments");
        let queue_dir = self.queue_dir(queue);
        for segment in start..=end {
            let raw = segment_path(&queue_dir, segment);
            let compressed = compressed_path(&raw);

            if raw.exists() {
                let next = segment_path(&queue_dir, segment + 1);
                if !next.exists() && !compressed_path(&next).exists() {
                    trace!(queue, segment, "Next segment not ready, stopping compression");
                    return;
                }
                if compressed.exists() {
                    debug!(queue, segment, "Segment already compressed");
                } else if let Err(e) = compress_file(&raw, &compressed, self.config.compress.segment.level) {
                    error!(queue, segment, error = ?e, "Failed to compress segment");
                    break;
                } else {
                    debug!(queue, segment, "Segment compressed");
                }
            } else {
                trace!(queue, segment, "Raw segment gone, nothing to compress");
            }

            if let Err(e) = set_segment_mark(self.kv.as_ref(), LAST_COMPRESSED_BUCKET, queue, segment) {
                error!(queue, segment, error = ?e, "Failed to store compressed mark");
                break;
            }

            if self.config.compress.delete_after_compress
                && compressed.exists()
                && self.outside_read_window(queue, segment)
            {
                match remove_if_exists(&raw) {
                    Ok(true) => debug!(queue, segment, "Removed compressed original"),
                    Ok(false) => {}
                    Err(e) => {
                        error!(queue, segment, error = ?e, "Failed to remove compressed original");
                        break;
                    }
                }
            }
        }
    }

    /// Whether `segment` lies outside `[earliest - threshold, latest + threshold]`
    /// of consumer positions, counting both as 0 without consumers.
    fn outside_read_window(&self, queue: &str, segment: u64) -> bool {
        let threshold = self.config.compress.idle_threshold;
        let earliest = self.progress.earliest_segment(queue).unwrap_or(0);
        let latest = self
            .progress
            .latest_segment(queue)
            .unwrap_or(0)
            .max(earliest);
        segment < earliest.saturating_sub(threshold) || segment > latest.saturating_add(threshold)
    }

    /// Restores up to `num_of_files_decompress_ahead` segments after
    /// `finished` so readers do not wait on decompression or download.
    pub(super) fn prepare_segments(&mut self, queue: &str, finished: u64) {
        if !self.config.compress.segment.enabled {
            return;
        }
        if self
            .last_prepared
            .get(queue)
            .is_some_and(|&prepared| finished < prepared)
        {
            return;
        }

        let mut prepared = finished;
        for ahead in 1..=self.config.compress.num_of_files_decompress_ahead {
            let segment = finished + ahead;
            let (_, exists) = self.resolver.resolve(queue, segment);
            if !exists {
                break;
            }
            prepared = segment;
        }
        trace!(queue, finished, prepared, "Prepared segments ahead of readers");
        self.last_prepared.insert(queue.to_string(), prepared);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{FixedProgress, LifecycleFixture};
    use crate::{CompressConfig, DiskQueueConfig, compression::compress_file, kv::segment_mark, path::compressed_path};

    fn config(skip_zero_consumers: bool) -> DiskQueueConfig {
        DiskQueueConfig {
            skip_zero_consumers,
            ..DiskQueueConfig::default()
        }
    }

    #[test]
    fn test_compresses_idle_segments_without_consumers() {
        let fixture = LifecycleFixture::new(config(false));
        fixture.write_segments(8);
        let lifecycle = fixture.lifecycle(FixedProgress::default(), None);

        lifecycle.compress_segments("q", 7);

        for segment in 0..=4 {
            assert!(compressed_path(&fixture.segment(segment)).exists(), "segment {segment}");
        }
        assert!(!compressed_path(&fixture.segment(5)).exists());
        // Window [0, 3] keeps recent originals.
        assert!(fixture.segment(3).exists());
        assert!(!fixture.segment(4).exists());
        assert_eq!(
            segment_mark(fixture.kv.as_ref(), crate::kv::LAST_COMPRESSED_BUCKET, "q").unwrap(),
            Some(4)
        );
    }

    #[test]
    fn test_compression_stays_behind_earliest_consumer() {
        let fixture = LifecycleFixture::new(config(false));
        fixture.write_segments(10);
        let lifecycle = fixture.lifecycle(FixedProgress::new(1, Some(3), Some(3)), None);

        lifecycle.compress_segments("q", 9);

        assert!(compressed_path(&fixture.segment(2)).exists());
        assert!(!compressed_path(&fixture.segment(3)).exists());
        // Inside [0, 6], originals are kept for readers.
        assert!(fixture.segment(0).exists());
        assert!(fixture.segment(2).exists());
    }

    #[test]
    fn test_compression_deletes_originals_far_behind_readers() {
        let fixture = LifecycleFixture::new(config(false));
        fixture.write_segments(12);
        let lifecycle = fixture.lifecycle(FixedProgress::new(2, Some(7), Some(8)), None);

        lifecycle.compress_segments("q", 11);

        assert!(!fixture.segment(3).exists());
        assert!(fixture.segment(4).exists());
        assert!(compressed_path(&fixture.segment(3)).exists());
    }

    #[test]
    fn test_skip_zero_consumers() {
        let fixture = LifecycleFixture::new(config(true));
        fixture.write_segments(8);
        fixture
            .lifecycle(FixedProgress::default(), None)
            .compress_segments("q", 7);
        assert!(!compressed_path(&fixture.segment(0)).exists());
    }

    #[test]
    fn test_compression_resumes_after_mark() {
        let fixture = LifecycleFixture::new(config(false));
        fixture.write_segments(8);
        let lifecycle = fixture.lifecycle(FixedProgress::default(), None);

        lifecycle.compress_segments("q", 5);
        assert!(!compressed_path(&fixture.segment(3)).exists());
        lifecycle.compress_segments("q", 7);
        assert!(compressed_path(&fixture.segment(3)).exists());
        assert!(compressed_path(&fixture.segment(4)).exists());
    }

    #[test]
    fn test_disabled_segment_compression() {
        let fixture = LifecycleFixture::new(DiskQueueConfig {
            compress: CompressConfig {
                segment: crate::CompressLevel {
                    enabled: false,
                    level:   3,
                },
                ..CompressConfig::default()
            },
            ..DiskQueueConfig::default()
        });
        fixture.write_segments(8);
        fixture
            .lifecycle(FixedProgress::default(), None)
            .compress_segments("q", 7);
        assert!(!compressed_path(&fixture.segment(0)).exists());
    }

    #[test]
    fn test_prepare_decompresses_ahead() {
        let fixture = LifecycleFixture::new(config(false));
        fixture.write_segments(6);
        for segment in 2..6 {
            let raw = fixture.segment(segment);
            compress_file(&raw, &compressed_path(&raw), 3).unwrap();
            std::fs::remove_file(raw).unwrap();
        }
        let mut lifecycle = fixture.lifecycle(FixedProgress::default(), None);

        lifecycle.prepare_segments("q", 1);
        assert!(fixture.segment(2).exists());
        assert!(fixture.segment(4).exists());
        assert!(!fixture.segment(5).exists());

        lifecycle.prepare_segments("q", 2);
        assert!(!fixture.segment(5).exists());
        lifecycle.prepare_segments("q", 4);
        assert!(fixture.segment(5).exists());
    }
}

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

//! Cold tier upload of closed segments.

use std::path::Path;

use tracing::{debug, error, trace, warn};

use super::SegmentLifecycle;
use crate::{
    Result,
    error::ColdTierSnafu,
    kv::{LAST_UPLOADED_BUCKET, segment_mark, set_segment_mark},
    path::{compressed_path, segment_path},
};

impl SegmentLifecycle {
    /// Uploads every segment after the uploaded mark up to `closed`, in order.
    ///
    /// The mark only advances past confirmed uploads; the first failure ends
    /// the pass and the next closed segment retries from there.
    pub(super) fn upload_segments(&self, queue: &str, closed: u64) {
        if !self.config.upload_to_s3 {
            return;
        }
        if self.config.skip_zero_consumers && self.progress.consumer_count(queue) == 0 {
            debug!(queue, "No consumers, skipping upload");
            return;
        }

        let last = match segment_mark(self.kv.as_ref(), LAST_UPLOADED_BUCKET, queue) {
            Ok(last) => last,
            Err(e) => {
                error!(queue, error = ?e, "Failed to read uploaded mark");
                return;
            }
        };
        let start = last.map_or(0, |last| last + 1);
        if start > closed {
            trace!(queue, closed, ?last, "Segments already uploaded");
            return;
        }

        let queue_dir = self.queue_dir(queue);
        for segment in start..=closed {
            let raw = segment_path(&queue_dir, segment);
            let compressed = compressed_path(&raw);
            let local = if compressed.exists() { compressed } else { raw };

            match self.upload_one(&local) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(queue, segment, "Cold tier rejected segment");
                    return;
                }
                Err(e) => {
                    error!(queue, segment, path = ?local, error = ?e, "Failed to upload segment");
                    return;
                }
            }

            if let Err(e) = set_segment_mark(self.kv.as_ref(), LAST_UPLOADED_BUCKET, queue, segment) {
                error!(queue, segment, error = ?e, "Failed to store uploaded mark");
                return;
            }
            debug!(queue, segment, path = ?local, "Segment uploaded");
        }
    }

    fn upload_one(&self, local: &Path) -> Result<bool> {
        let target = &self.config.cold_tier;
        let Some(store) = self.object_store.as_ref() else {
            return ColdTierSnafu {
                message: "no object store configured",
            }
            .fail();
        };
        snafu::ensure!(
            target.is_configured(),
            ColdTierSnafu {
                message: "cold tier bucket is not configured",
            }
        );
        snafu::ensure!(
            local.exists(),
            ColdTierSnafu {
                message: format!("{} is missing locally", local.display()),
            }
        );

        let object_name = self.resolver.object_name(local);
        if target.async_upload {
            store.async_upload(target, &object_name, local)?;
            Ok(true)
        } else {
            store.sync_upload(target, &object_name, local)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::tests::{FixedProgress, LifecycleFixture};
    use crate::{
        ColdTierConfig, DiskQueueConfig, LocalObjectStore,
        compression::compress_file,
        kv::{LAST_UPLOADED_BUCKET, segment_mark},
        object_store::ObjectStore,
        path::compressed_path,
    };

    fn config(bucket: &str) -> DiskQueueConfig {
        DiskQueueConfig {
            upload_to_s3: true,
            cold_tier: ColdTierConfig::builder().bucket(bucket).build(),
            ..DiskQueueConfig::default()
        }
    }

    #[test]
    fn test_uploads_up_to_closed_segment() {
        let fixture = LifecycleFixture::new(config("archive"));
        fixture.write_segments(4);
        let raw = fixture.segment(0);
        compress_file(&raw, &compressed_path(&raw), 3).unwrap();

        let store = Arc::new(LocalObjectStore::new(fixture.data_dir().join("cold")));
        let lifecycle = fixture.lifecycle(FixedProgress::new(1, Some(0), Some(0)), Some(store.clone()));
        lifecycle.upload_segments("q", 2);

        let target = &fixture.config.cold_tier;
        assert!(
            store
                .object_path(target, "queue/q/000000000.dat.zstd")
                .exists()
        );
        assert!(store.object_path(target, "queue/q/000000002.dat").exists());
        assert!(!store.object_path(target, "queue/q/000000003.dat").exists());
        assert_eq!(
            segment_mark(fixture.kv.as_ref(), LAST_UPLOADED_BUCKET, "q").unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_failed_upload_keeps_mark() {
        let fixture = LifecycleFixture::new(config(""));
        fixture.write_segments(3);
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(fixture.data_dir().join("cold")));
        let lifecycle = fixture.lifecycle(FixedProgress::new(1, Some(0), Some(0)), Some(store));

        lifecycle.upload_segments("q", 2);
        assert_eq!(segment_mark(fixture.kv.as_ref(), LAST_UPLOADED_BUCKET, "q").unwrap(), None);
    }

    #[test]
    fn test_missing_segment_stops_upload() {
        let fixture = LifecycleFixture::new(config("archive"));
        fixture.write_segments(4);
        std::fs::remove_file(fixture.segment(1)).unwrap();

        let store = Arc::new(LocalObjectStore::new(fixture.data_dir().join("cold")));
        let lifecycle = fixture.lifecycle(FixedProgress::new(1, Some(0), Some(0)), Some(store));
        lifecycle.upload_segments("q", 3);
        assert_eq!(
            segment_mark(fixture.kv.as_ref(), LAST_UPLOADED_BUCKET, "q").unwrap(),
            Some(0)
        );
    }
}

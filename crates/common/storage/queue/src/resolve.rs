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

//! Locating readable segment files.
//!
//! A segment may live in three places: the raw file on local disk, a zstd
//! sibling next to it, or the cold tier. [`SegmentResolver::resolve`] tries
//! them in that order and materializes the raw file locally.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    DiskQueueConfig, Result,
    compression::decompress_file,
    object_store::ObjectStore,
    path::{compressed_path, queue_dir, segment_path},
};

pub struct SegmentResolver {
    data_dir:     PathBuf,
    config:       Arc<DiskQueueConfig>,
    object_store: Option<Arc<dyn ObjectStore>>,
    /// Serializes restores so concurrent readers of one segment see the
    /// result of a single decompress or download.
    restore:      Mutex<()>,
}

impl SegmentResolver {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        config: Arc<DiskQueueConfig>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            config,
            object_store,
            restore: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path { &self.data_dir }

    pub fn queue_dir(&self, queue_id: &str) -> PathBuf { queue_dir(&self.data_dir, queue_id) }

    pub fn segment_path(&self, queue_id: &str, segment: u64) -> PathBuf {
        segment_path(self.queue_dir(queue_id), segment)
    }

    /// Cold tier object name of a local file: the configured prefix followed
    /// by the path relative to the data directory.
    pub fn object_name(&self, local: &Path) -> String {
        let relative = local.strip_prefix(&self.data_dir).unwrap_or(local);
        let relative = relative.to_string_lossy().replace('\\', "/");
        let prefix = self.config.cold_tier.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            relative
        } else {
            format!("{prefix}/{relative}")
        }
    }

    /// Returns the raw segment path and whether it exists after trying the
    /// local file, the local compressed sibling and the cold tier.
    pub fn resolve(&self, queue_id: &str, segment: u64) -> (PathBuf, bool) {
        let path = self.segment_path(queue_id, segment);
        if path.exists() {
            return (path, true);
        }

        let _restore = self.restore.lock();
        // Another reader may have restored it while we waited.
        if path.exists() {
            return (path, true);
        }

        let compressed = compressed_path(&path);
        if compressed.exists() {
            match decompress_file(&compressed, &path) {
                Ok(()) => {
                    debug!(queue = queue_id, segment, "Decompressed segment for reading");
                    return (path, true);
                }
                Err(e) => warn!(queue = queue_id, segment, error = ?e, "Failed to decompress segment"),
            }
        }

        if self.download_enabled() {
            match self.download(&path) {
                Ok(true) => return (path, true),
                Ok(false) => {}
                Err(e) => warn!(queue = queue_id, segment, error = ?e, "Failed to download segment"),
            }
        }

        let exists = path.exists();
        (path, exists)
    }

    fn download_enabled(&self) -> bool {
        self.config.always_download && self.object_store.is_some() && self.config.cold_tier.is_configured()
    }

    fn download(&self, path: &Path) -> Result<bool> {
        let Some(store) = self.object_store.as_ref() else {
            return Ok(false);
        };
        let target = &self.config.cold_tier;

        let compressed = compressed_path(path);
        if store.sync_download(target, &self.object_name(&compressed), &compressed)? {
            decompress_file(&compressed, path)?;
            debug!(path = ?path, "Restored compressed segment from cold tier");
            return Ok(true);
        }

        if store.sync_download(target, &self.object_name(path), path)? {
            debug!(path = ?path, "Restored segment from cold tier");
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use tempfile::TempDir;

    use super::*;
    use crate::{ColdTierConfig, LocalObjectStore, compression::compress_file};

    fn resolver(dir: &Path, store: Option<Arc<dyn ObjectStore>>) -> SegmentResolver {
        let config = DiskQueueConfig {
            always_download: true,
            cold_tier: ColdTierConfig::builder()
                .bucket("cold")
                .prefix("backup/")
                .build(),
            ..DiskQueueConfig::default()
        };
        SegmentResolver::new(dir, Arc::new(config), store)
    }

    #[test]
    fn test_object_name() {
        let r = resolver(Path::new("/data"), None);
        assert_eq!(
            r.object_name(Path::new("/data/queue/q/000000001.dat")),
            "backup/queue/q/000000001.dat"
        );
    }

    #[test]
    fn test_resolve_local_then_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let r = resolver(temp_dir.path(), None);
        std::fs::create_dir_all(r.queue_dir("q")).unwrap();

        let (path, exists) = r.resolve("q", 0);
        assert!(!exists);
        assert_eq!(path, r.segment_path("q", 0));

        std::fs::write(&path, b"frames").unwrap();
        assert!(r.resolve("q", 0).1);

        let compressed = compressed_path(&path);
        compress_file(&path, &compressed, 3).unwrap();
        std::fs::remove_file(&path).unwrap();

        let (path, exists) = r.resolve("q", 0);
        assert!(exists);
        assert_eq!(std::fs::read(path).unwrap(), b"frames");
    }

    #[test]
    fn test_concurrent_resolve_of_compressed_segment() {
        let temp_dir = TempDir::new().unwrap();
        let r = Arc::new(resolver(temp_dir.path(), None));
        std::fs::create_dir_all(r.queue_dir("q")).unwrap();
        let data: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();

        for segment in 0..5 {
            let path = r.segment_path("q", segment);
            std::fs::write(&path, &data).unwrap();
            compress_file(&path, &compressed_path(&path), 3).unwrap();
            std::fs::remove_file(&path).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let r = r.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        r.resolve("q", segment)
                    })
                })
                .collect();

            for handle in handles {
                let (path, exists) = handle.join().unwrap();
                assert!(exists, "segment {segment} reported missing");
                assert_eq!(std::fs::read(path).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_resolve_downloads_from_cold_tier() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(temp_dir.path().join("cold")));
        let r = resolver(temp_dir.path().join("data").as_path(), Some(store.clone()));
        std::fs::create_dir_all(r.queue_dir("q")).unwrap();

        let path = r.segment_path("q", 3);
        std::fs::write(&path, b"archived").unwrap();
        let compressed = compressed_path(&path);
        compress_file(&path, &compressed, 3).unwrap();
        let target = ColdTierConfig::builder().bucket("cold").build();
        store
            .sync_upload(&target, &r.object_name(&compressed), &compressed)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::remove_file(&compressed).unwrap();

        let (path, exists) = r.resolve("q", 3);
        assert!(exists);
        assert_eq!(std::fs::read(path).unwrap(), b"archived");
    }
}

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

//! Bucketed key-value storage used for committed offsets and segment
//! high-water marks.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Result, error::KvStoreSnafu};

/// Bucket holding the last compressed segment of each queue.
pub const LAST_COMPRESSED_BUCKET: &str = "last_compress_file_for_queue";
/// Bucket holding the last uploaded segment of each queue.
pub const LAST_UPLOADED_BUCKET: &str = "last_success_file_for_queue";

pub trait KvStore: Send + Sync {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    fn exists(&self, bucket: &str, key: &[u8]) -> Result<bool> { Ok(self.get(bucket, key)?.is_some()) }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()>;
}

/// Process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    buckets: RwLock<HashMap<String, HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self { Self::default() }
}

impl KvStore for MemoryKvStore {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }
}

/// Reads a segment high-water mark. `None` means no segment was processed.
pub(crate) fn segment_mark(kv: &dyn KvStore, bucket: &str, queue_id: &str) -> Result<Option<u64>> {
    let Some(raw) = kv.get(bucket, queue_id.as_bytes())? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
        KvStoreSnafu {
            message: format!("mark for {queue_id} in {bucket} has {} bytes", raw.len()),
        }
        .build()
    })?;
    // Stored as signed big-endian with -1 meaning "none".
    let value = i64::from_be_bytes(bytes);
    Ok(u64::try_from(value).ok())
}

pub(crate) fn set_segment_mark(kv: &dyn KvStore, bucket: &str, queue_id: &str, segment: u64) -> Result<()> {
    let value = i64::try_from(segment).map_err(|_| {
        KvStoreSnafu {
            message: format!("segment {segment} does not fit a mark"),
        }
        .build()
    })?;
    kv.put(bucket, queue_id.as_bytes(), &value.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_buckets_are_isolated() {
        let kv = MemoryKvStore::new();
        kv.put("a", b"k", b"1").unwrap();
        kv.put("b", b"k", b"2").unwrap();

        assert_eq!(kv.get("a", b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("b", b"k").unwrap(), Some(b"2".to_vec()));
        assert!(kv.exists("a", b"k").unwrap());

        kv.delete("a", b"k").unwrap();
        assert!(!kv.exists("a", b"k").unwrap());
        assert!(kv.exists("b", b"k").unwrap());
        kv.delete("missing", b"k").unwrap();
    }

    #[test]
    fn test_segment_marks() {
        let kv = MemoryKvStore::new();
        assert_eq!(segment_mark(&kv, LAST_UPLOADED_BUCKET, "q").unwrap(), None);

        set_segment_mark(&kv, LAST_UPLOADED_BUCKET, "q", 42).unwrap();
        assert_eq!(segment_mark(&kv, LAST_UPLOADED_BUCKET, "q").unwrap(), Some(42));
        assert_eq!(
            kv.get(LAST_UPLOADED_BUCKET, b"q").unwrap(),
            Some(42i64.to_be_bytes().to_vec())
        );

        kv.put(LAST_COMPRESSED_BUCKET, b"q", &(-1i64).to_be_bytes())
            .unwrap();
        assert_eq!(segment_mark(&kv, LAST_COMPRESSED_BUCKET, "q").unwrap(), None);
    }

    #[test]
    fn test_malformed_mark() {
        let kv = MemoryKvStore::new();
        kv.put(LAST_COMPRESSED_BUCKET, b"q", b"abc").unwrap();
        assert!(segment_mark(&kv, LAST_COMPRESSED_BUCKET, "q").is_err());
    }
}

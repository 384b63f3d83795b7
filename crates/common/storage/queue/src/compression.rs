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

//! zstd helpers for message payloads and whole segment files.
//!
//! File helpers write to a uniquely named `.tmp` sibling and rename it into
//! place, so a reader never observes a partially written artifact and two
//! writers of the same target never share scratch space.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use bytes::Bytes;
use snafu::ResultExt;

use crate::{Result, error::CompressionSnafu, path::unique_tmp_path};

pub(crate) fn compress_message(data: &[u8], level: i32) -> Result<Bytes> {
    zstd::encode_all(data, level)
        .map(Bytes::from)
        .context(CompressionSnafu)
}

pub(crate) fn decompress_message(data: &[u8]) -> Result<Bytes> {
    zstd::decode_all(data)
        .map(Bytes::from)
        .context(CompressionSnafu)
}

/// Compresses `src` into `dst`.
pub(crate) fn compress_file(src: &Path, dst: &Path, level: i32) -> Result<()> {
    let tmp = unique_tmp_path(dst);
    let result = (|| -> Result<()> {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(&tmp)?);
        zstd::stream::copy_encode(reader, &mut writer, level).context(CompressionSnafu)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    finish(result, &tmp, dst)
}

/// Decompresses `src` into `dst`.
pub(crate) fn decompress_file(src: &Path, dst: &Path) -> Result<()> {
    let tmp = unique_tmp_path(dst);
    let result = (|| -> Result<()> {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(&tmp)?);
        zstd::stream::copy_decode(reader, &mut writer).context(CompressionSnafu)?;
        writer.flush()?;
        Ok(())
    })();

    finish(result, &tmp, dst)
}

fn finish(result: Result<()>, tmp: &Path, dst: &Path) -> Result<()> {
    match result {
        Ok(()) => {
            fs::rename(tmp, dst)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(tmp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_message_compression() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let compressed = compress_message(data, 3).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_message(&compressed).unwrap(), Bytes::from_static(data));
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(matches!(
            decompress_message(b"not zstd"),
            Err(crate::QueueError::Compression { .. })
        ));
    }

    #[test]
    fn test_file_compression_leaves_no_tmp() {
        let temp_dir = TempDir::new().unwrap();
        let raw = temp_dir.path().join("000000000.dat");
        let packed = temp_dir.path().join("000000000.dat.zstd");
        let restored = temp_dir.path().join("restored.dat");
        std::fs::write(&raw, vec![7u8; 4096]).unwrap();

        compress_file(&raw, &packed, 11).unwrap();
        decompress_file(&packed, &restored).unwrap();

        assert_eq!(std::fs::read(&restored).unwrap(), vec![7u8; 4096]);
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "leftover scratch files: {leftovers:?}");
    }

    #[test]
    fn test_concurrent_decompress_into_same_target() {
        let temp_dir = TempDir::new().unwrap();
        let raw = temp_dir.path().join("000000000.dat");
        let packed = temp_dir.path().join("000000000.dat.zstd");
        let restored = temp_dir.path().join("restored.dat");
        let data: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&raw, &data).unwrap();
        compress_file(&raw, &packed, 3).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| decompress_file(&packed, &restored).unwrap());
            }
        });

        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn test_compress_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let dst = temp_dir.path().join("x.zstd");
        assert!(compress_file(&temp_dir.path().join("missing"), &dst, 3).is_err());
        assert!(!dst.exists());
    }
}

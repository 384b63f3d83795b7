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

//! On-disk naming.
//!
//! ```text
//! <data_dir>/queue/<queue id, lowercased>/
//!     meta.dat
//!     000000000.dat
//!     000000001.dat.zstd
//!     000000002.dat.bad
//! ```

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::Result;

pub const QUEUE_DIR_NAME: &str = "queue";
pub const META_FILE_NAME: &str = "meta.dat";
pub const SEGMENT_EXTENSION: &str = ".dat";
pub const COMPRESSED_SUFFIX: &str = ".zstd";
pub const BAD_SUFFIX: &str = ".bad";

/// Returns the directory holding one queue: `data_dir/queue/<lowercased id>`.
pub fn queue_dir<P: AsRef<Path>>(data_dir: P, queue_id: &str) -> PathBuf {
    data_dir
        .as_ref()
        .join(QUEUE_DIR_NAME)
        .join(queue_id.to_lowercase())
}

/// Generates a segment file name: `NNNNNNNNN.dat`.
pub fn segment_file_name(segment: u64) -> String { format!("{segment:09}{SEGMENT_EXTENSION}") }

pub fn segment_path<P: AsRef<Path>>(queue_dir: P, segment: u64) -> PathBuf {
    queue_dir.as_ref().join(segment_file_name(segment))
}

pub fn metadata_path<P: AsRef<Path>>(queue_dir: P) -> PathBuf {
    queue_dir.as_ref().join(META_FILE_NAME)
}

/// Sibling holding the zstd-compressed copy of a segment.
pub fn compressed_path(segment_path: &Path) -> PathBuf { with_suffix(segment_path, COMPRESSED_SUFFIX) }

/// Name a corrupt segment is moved to.
pub fn bad_path(segment_path: &Path) -> PathBuf { with_suffix(segment_path, BAD_SUFFIX) }

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Scratch sibling of `path` that no concurrent writer of the same target
/// shares: `<path>.<uuid>.tmp`.
pub(crate) fn unique_tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, &format!(".{}.tmp", Uuid::new_v4().simple()))
}

/// Parses the segment number out of `NNNNNNNNN.dat` or `NNNNNNNNN.dat.zstd`.
pub fn parse_segment_number(file_name: &str) -> Option<u64> {
    let stem = file_name
        .strip_suffix(COMPRESSED_SUFFIX)
        .unwrap_or(file_name)
        .strip_suffix(SEGMENT_EXTENSION)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Lists the segment numbers present in a queue directory, raw or
/// compressed, sorted and deduplicated.
pub fn scan_segments<P: AsRef<Path>>(queue_dir: P) -> Result<Vec<u64>> {
    let dir = queue_dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(segment) = entry.file_name().to_str().and_then(parse_segment_number) {
            segments.push(segment);
        }
    }

    segments.sort_unstable();
    segments.dedup();
    Ok(segments)
}

/// Recursively sums the size of every file under `dir`.
pub fn dir_size<P: AsRef<Path>>(dir: P) -> Result<u64> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(0);
    }

    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Removes a file, treating an already missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_queue_dir_is_lowercased() {
        let dir = queue_dir("/data", "Orders-EU");
        assert_eq!(dir, PathBuf::from("/data/queue/orders-eu"));
    }

    #[test]
    fn test_segment_paths() {
        let seg = segment_path("/q", 7);
        assert_eq!(seg, PathBuf::from("/q/000000007.dat"));
        assert_eq!(compressed_path(&seg), PathBuf::from("/q/000000007.dat.zstd"));
        assert_eq!(bad_path(&seg), PathBuf::from("/q/000000007.dat.bad"));
        assert_eq!(metadata_path("/q"), PathBuf::from("/q/meta.dat"));
    }

    #[test_case("000000042.dat", Some(42); "raw")]
    #[test_case("000000042.dat.zstd", Some(42); "compressed")]
    #[test_case("000000042.dat.bad", None; "bad")]
    #[test_case("meta.dat", None; "metadata")]
    #[test_case(".dat", None; "empty stem")]
    #[test_case("000000042.dat.tmp", None; "temporary")]
    fn test_parse_segment_number(name: &str, expected: Option<u64>) {
        assert_eq!(parse_segment_number(name), expected);
    }

    #[test]
    fn test_scan_segments() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let base = temp_dir.path();

        for name in [
            "000000003.dat",
            "000000001.dat",
            "000000001.dat.zstd",
            "000000002.dat.zstd",
            "000000004.dat.bad",
            "meta.dat",
        ] {
            std::fs::File::create(base.join(name)).unwrap();
        }

        assert_eq!(scan_segments(base).unwrap(), vec![1, 2, 3]);
        assert!(scan_segments(base.join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_dir_size_recurses() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp_dir.path().join("x"), [0u8; 10]).unwrap();
        std::fs::write(nested.join("y"), [0u8; 5]).unwrap();

        assert_eq!(dir_size(temp_dir.path()).unwrap(), 15);
    }
}

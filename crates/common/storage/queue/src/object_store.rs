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

//! Cold tier for closed segments.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{ColdTierConfig, Result, error::ColdTierSnafu, path::unique_tmp_path};

pub trait ObjectStore: Send + Sync {
    /// Uploads `local` and returns whether the object was stored.
    fn sync_upload(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<bool>;

    /// Starts an upload without waiting for it. Returns once the upload is
    /// accepted.
    fn async_upload(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<()>;

    /// Downloads `object_name` into `local`. Returns `false` when the object
    /// does not exist.
    fn sync_download(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<bool>;
}

/// Async uploads waiting for the worker before `async_upload` blocks.
const UPLOAD_QUEUE_CAPACITY: usize = 1024;

struct UploadJob {
    src:    PathBuf,
    dst:    PathBuf,
    object: String,
}

/// [`ObjectStore`] backed by a local directory: objects live at
/// `<root>/<bucket>/<object name>`.
///
/// Async uploads are copied by one worker thread, started on first use and
/// shared by all clones. It exits once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root:    PathBuf,
    uploads: Arc<Mutex<Option<Sender<UploadJob>>>>,
}

impl LocalObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root:    root.as_ref().to_path_buf(),
            uploads: Arc::new(Mutex::new(None)),
        }
    }

    fn upload_sender(&self) -> Result<Sender<UploadJob>> {
        let mut uploads = self.uploads.lock();
        if let Some(tx) = uploads.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = channel::bounded::<UploadJob>(UPLOAD_QUEUE_CAPACITY);
        std::thread::Builder::new()
            .name("cold-tier-upload".to_string())
            .spawn(move || {
                for job in rx {
                    match copy_atomically(&job.src, &job.dst) {
                        Ok(()) => debug!(object = job.object, path = ?job.dst, "Uploaded segment"),
                        Err(e) => error!(object = job.object, error = ?e, "Async upload failed"),
                    }
                }
                debug!("Upload worker stopped");
            })?;
        *uploads = Some(tx.clone());
        Ok(tx)
    }

    pub fn object_path(&self, target: &ColdTierConfig, object_name: &str) -> PathBuf {
        self.root
            .join(&target.bucket)
            .join(object_name.trim_start_matches('/'))
    }
}

fn copy_atomically(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = unique_tmp_path(dst);
    fs::copy(src, &tmp)?;
    fs::rename(&tmp, dst)?;
    Ok(())
}

impl ObjectStore for LocalObjectStore {
    fn sync_upload(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<bool> {
        snafu::ensure!(
            target.is_configured(),
            ColdTierSnafu {
                message: "bucket is not configured",
            }
        );
        let dst = self.object_path(target, object_name);
        copy_atomically(local, &dst)?;
        debug!(object = object_name, path = ?dst, "Uploaded segment");
        Ok(true)
    }

    fn async_upload(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<()> {
        snafu::ensure!(
            target.is_configured(),
            ColdTierSnafu {
                message: "bucket is not configured",
            }
        );
        let job = UploadJob {
            src:    local.to_path_buf(),
            dst:    self.object_path(target, object_name),
            object: object_name.to_string(),
        };
        self.upload_sender()?.send(job).map_err(|_| {
            ColdTierSnafu {
                message: "upload worker is gone",
            }
            .build()
        })
    }

    fn sync_download(&self, target: &ColdTierConfig, object_name: &str, local: &Path) -> Result<bool> {
        let src = self.object_path(target, object_name);
        if !src.exists() {
            return Ok(false);
        }
        copy_atomically(&src, local)?;
        debug!(object = object_name, path = ?local, "Downloaded segment");
        Ok(true)
    }
}

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

use std::{fs, path::PathBuf, sync::Arc};

use crate::{
    DiskQueueConfig, DiskQueueModule, Result,
    error::InvalidConfigSnafu,
    kv::{KvStore, MemoryKvStore},
    object_store::ObjectStore,
};

pub struct DiskQueueModuleBuilder {
    data_dir:     PathBuf,
    config:       DiskQueueConfig,
    kv:           Option<Arc<dyn KvStore>>,
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl DiskQueueModuleBuilder {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir:     data_dir.into(),
            config:       DiskQueueConfig::default(),
            kv:           None,
            object_store: None,
        }
    }

    pub fn config(mut self, config: DiskQueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_bytes_per_file(mut self, size: u64) -> Self {
        self.config.max_bytes_per_file = size;
        self
    }

    pub fn sync_every_records(mut self, records: u64) -> Self {
        self.config.sync_every_records = records;
        self
    }

    /// Store for committed offsets and lifecycle marks. Defaults to an
    /// in-memory store.
    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn build(self) -> Result<DiskQueueModule> {
        let config = &self.config;
        snafu::ensure!(
            config.min_msg_size <= config.max_msg_size,
            InvalidConfigSnafu {
                message: format!(
                    "min_msg_size {} exceeds max_msg_size {}",
                    config.min_msg_size, config.max_msg_size
                ),
            }
        );
        snafu::ensure!(
            config.max_bytes_per_file > 0,
            InvalidConfigSnafu {
                message: "max_bytes_per_file must be positive",
            }
        );

        fs::create_dir_all(&self.data_dir)?;
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()));
        Ok(DiskQueueModule::new(self.data_dir, self.config, kv, self.object_store))
    }
}

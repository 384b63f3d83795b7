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

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::{Offset, QueueConfig, Result, WriteResponse, message::check_message_size, queue::SegmentLog};

/// One message of a [`Producer::produce`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub topic: String,
    pub data:  Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub topic:     String,
    /// Always 0: a disk queue has a single partition.
    pub partition: i64,
    /// Write position after the message.
    pub offset:    Offset,
    /// Unix milliseconds at which the write was acknowledged.
    pub timestamp: i64,
}

/// Write handle of one queue.
pub struct Producer {
    log:   Arc<SegmentLog>,
    queue: QueueConfig,
}

impl Producer {
    pub(crate) const fn new(log: Arc<SegmentLog>, queue: QueueConfig) -> Self { Self { log, queue } }

    pub const fn queue(&self) -> &QueueConfig { &self.queue }

    /// Appends one message after checking its size.
    pub fn put(&self, data: impl Into<Bytes>) -> Result<WriteResponse> {
        let data = data.into();
        check_message_size(data.len(), &self.log.env().config)?;
        self.log.put(data)
    }

    /// Appends every request in order, stopping at the first failure.
    pub fn produce(&self, requests: &[ProduceRequest]) -> Result<Vec<ProduceResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let written = self.put(request.data.clone())?;
            responses.push(ProduceResponse {
                topic:     request.topic.clone(),
                partition: 0,
                offset:    written.offset(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
        trace!(queue = %self.queue.id, count = responses.len(), "Produced batch");
        Ok(responses)
    }
}

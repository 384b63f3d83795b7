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

//! Local retention.
//!
//! A segment is deleted only when every consumer has moved past it, it is
//! older than the newest `max_num_of_local_files` segments and, with cold
//! tier upload on, it has been uploaded. Queues without consumers keep their
//! files.

use tracing::{debug, error, trace};

use super::SegmentLifecycle;
use crate::{
    Result,
    kv::{LAST_UPLOADED_BUCKET, segment_mark},
    path::{compressed_path, remove_if_exists, scan_segments, segment_path},
};

impl SegmentLifecycle {
    pub(super) fn delete_unused_segments(&self, queue: &str, segment: u64) {
        let end = match self.deletable_up_to(queue, segment) {
            Ok(Some(end)) => end,
            Ok(None) => return,
            Err(e) => {
                error!(queue, segment, error = ?e, "Failed to compute retention bound");
                return;
            }
        };
        Self::log_failure(queue, end, "delete unused segments", self.delete_up_to(queue, end));
    }

    /// Highest segment that may be deleted, if any.
    fn deletable_up_to(&self, queue: &str, segment: u64) -> Result<Option<u64>> {
        if self.progress.consumer_count(queue) == 0 {
            trace!(queue, "No consumers, keeping local segments");
            return Ok(None);
        }
        let Some(earliest) = self.progress.earliest_segment(queue) else {
            return Ok(None);
        };

        let mut bounds = vec![
            segment.checked_sub(self.config.retention.max_num_of_local_files),
            earliest.checked_sub(1),
        ];
        if self.config.upload_to_s3 {
            bounds.push(segment_mark(self.kv.as_ref(), LAST_UPLOADED_BUCKET, queue)?);
        }

        let end = bounds
            .into_iter()
            .try_fold(u64::MAX, |end, bound| bound.map(|bound| end.min(bound)));
        trace!(queue, segment, earliest, ?end, "Retention bound");
        Ok(end)
    }

    fn delete_up_to(&self, queue: &str, end: u64) -> Result<()> {
        let queue_dir = self.queue_dir(queue);
        let mut deleted = 0usize;
        for segment in scan_segments(&queue_dir)?
            .into_iter()
            .take_while(|&segment| segment <= end)
        {
            let raw = segment_path(&queue_dir, segment);
            for path in [compressed_path(&raw), raw] {
                if remove_if_exists(&path)? {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            debug!(queue, end, deleted, "Deleted unused segments");
        }
        Ok(())
    }
}

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

//! Segment lifecycle events.
//!
//! Writers announce closed segments and readers announce segments they
//! finished. Events travel over a bounded channel to the lifecycle manager;
//! a full channel blocks the announcing thread.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEventKind {
    /// The writer moved past this segment.
    WriteComplete,
    /// A reader moved past this segment.
    ReadComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    pub queue:   String,
    pub kind:    SegmentEventKind,
    pub segment: u64,
}

/// Cloneable sending side of the event channel.
///
/// Events are dropped while no lifecycle manager is attached.
#[derive(Debug, Clone, Default)]
pub struct EventNotifier {
    tx: Arc<RwLock<Option<Sender<SegmentEvent>>>>,
}

impl EventNotifier {
    pub fn new() -> Self { Self::default() }

    /// Creates a bounded channel and attaches its sender.
    pub fn attach(&self, buffer: usize) -> Receiver<SegmentEvent> {
        let (tx, rx) = channel::bounded(buffer);
        *self.tx.write() = Some(tx);
        rx
    }

    /// Drops the sender so the receiving side drains and disconnects.
    pub fn detach(&self) { self.tx.write().take(); }

    pub fn is_attached(&self) -> bool { self.tx.read().is_some() }

    pub fn notify(&self, queue: &str, kind: SegmentEventKind, segment: u64) {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            trace!(queue, ?kind, segment, "No lifecycle manager attached, dropping event");
            return;
        };
        let event = SegmentEvent {
            queue: queue.to_string(),
            kind,
            segment,
        };
        if tx.send(event).is_err() {
            trace!(queue, ?kind, segment, "Lifecycle manager gone, dropping event");
        }
    }
}

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

//! Durable, segmented, append-only disk queue.
//!
//! Each queue is a directory of fixed-size segment files written by a single
//! IO thread. Messages are length-prefixed frames. Consumers read through
//! independent cursors whose committed offsets live in a [`KvStore`], and a
//! background [`LifecycleManager`] compresses, uploads and deletes segments
//! once every consumer has moved past them.
//!
//! Queues without registered consumers run in channel mode: the writer feeds
//! messages into a bounded channel drained by [`DiskQueueModule::pop`].

pub mod builder;
pub mod capacity;
mod compression;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
mod io_worker;
pub mod kv;
pub mod lifecycle;
pub mod message;
mod metadata;
pub mod module;
pub mod object_store;
pub mod offset;
pub mod offset_store;
pub mod path;
pub mod producer;
pub mod queue;
mod recovery;
pub mod resolve;
pub mod throttle;

pub use builder::DiskQueueModuleBuilder;
pub use capacity::CapacityGuard;
pub use config::{
    ColdTierConfig, CompressConfig, CompressLevel, ConsumerConfig, DiskQueueConfig, QueueConfig, RetentionConfig,
};
pub use consumer::Consumer;
pub use error::{QueueError, Result};
pub use event::{EventNotifier, SegmentEvent, SegmentEventKind};
pub use kv::{KvStore, MemoryKvStore};
pub use lifecycle::{ConsumerProgress, LifecycleManager};
pub use message::{Message, WriteResponse};
pub use module::DiskQueueModule;
pub use object_store::{LocalObjectStore, ObjectStore};
pub use offset::{FetchContext, Offset};
pub use offset_store::OffsetStore;
pub use producer::{ProduceRequest, ProduceResponse, Producer};
pub use queue::{QueueEnv, SegmentLog};
pub use resolve::SegmentResolver;
pub use throttle::LogThrottle;

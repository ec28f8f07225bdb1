//! # Scoria
//!
//! The GPU resource lifecycle core of a real-time renderer: device memory
//! placement, shader-visible descriptor tables, staged uploads, and
//! access/layout transition tracking, synchronized through monotonically
//! increasing submission counters rather than blocking locks.
//!
//! Scoria computes *where things go and when they may be reused*; the
//! rendering frontend performs the actual driver calls from the placements,
//! descriptor indices, staging layouts, and barrier batches produced here,
//! and reports fence progress back. Everything above this layer — shader
//! compilation, scene composition, asset decoding, presentation — is a
//! client.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//! use scoria::{ash::vk, heap::HeapPoolDesc, staging::CopyEngineDesc};
//!
//! // One device, one graphics queue.
//! let mut builder = Device::builder();
//! let gfx = builder.add_queue(QueueKind::Graphics);
//! let device = builder.build();
//!
//! // Allocators: a block pool for placements, a fixed descriptor table,
//! // a copy engine for staged uploads, and the submitter tying them together.
//! let pool = HeapPool::new(device.clone(), gfx, HeapPoolDesc::default());
//! let table = DescriptorTable::new(1 << 16);
//! let engine = CopyEngine::new(device.clone(), gfx, CopyEngineDesc::default());
//! let submitter = Submitter::new(device.clone(), gfx);
//!
//! // Place a vertex buffer and bind it.
//! let desc = ResourceDesc::buffer(64 * 1024, vk::BufferUsageFlags::VERTEX_BUFFER)
//!     .with_label("triangle vertices");
//! let vertices = pool.acquire(&desc, false)?.handle;
//! submitter.adopt(vertices, Access::NONE, None);
//! let binding = table.alloc(1, device.queue(gfx).completed_value())?;
//!
//! // Stage bytes and build a batch around the upload.
//! let mut batch = submitter.begin();
//! let mut pass = engine.open()?;
//! let mut staging = pass.reserve(64 * 1024, 256)?;
//! staging.write(&[0u8; 64 * 1024]);
//! batch.stage_buffer_upload(&mut pass, &staging, vertices, 0);
//! batch.transition(vertices, Access::SHADER_READ, None);
//! batch.add_pass(&engine, pass);
//!
//! // The frontend issues `submission.barriers`, then `submission.copies`,
//! // then its draws, and signals the fence when the device is done.
//! let submission = batch.submit()?;
//! device.queue(gfx).signal(submission.sync.value);
//!
//! // Reclaim, gated on the batch that last used the resource.
//! let mut batch = submitter.begin();
//! batch.release_resource(&pool, vertices);
//! batch.release_descriptors(&table, binding);
//! batch.submit()?;
//! # Ok::<(), scoria::Error>(())
//! ```
//!
//! ## Overview
//!
//! - [`sync`]: per-queue submission [`Timeline`]s and fence-gated deferred
//!   release. Reuse anywhere in the crate is decided by comparing the live
//!   completed counter against a tagged sync value — never by convention.
//! - [`heap`]: the block pool allocator placing resources inside
//!   fixed-capacity heaps, with coalescing, a last-resort device stall, and
//!   opt-in transient aliasing.
//! - [`descriptor`]: buddy allocation of contiguous ranges from one fixed
//!   shader-visible binding table.
//! - [`staging`]: growable per-context staging rings and the copy engine
//!   feeding the upload queue.
//! - [`tracking`]: per-resource access/layout state with pending-barrier
//!   coalescing.
//! - [`submit`]: per-batch composition; one fence value gates a batch's
//!   uploads, transitions, and releases.
//!
//! ## Concurrency Model
//!
//! Worker threads build independent batches in parallel. Each allocator
//! instance guards its state with one mutex held only for the duration of a
//! single allocate/release call; the only blocking wait is the heap pool's
//! deliberate device-idle stall on exhaustion. Heaps, descriptor tables, and
//! staging rings are each owned by exactly one allocator instance, and
//! separate instances per usage category remove cross-category contention.

pub mod descriptor;
pub mod device;
pub mod error;
pub mod heap;
pub mod resource;
pub mod staging;
pub mod submit;
pub mod sync;
pub mod tracking;

pub use device::{Device, HasDevice};
pub use error::{Error, Result};
pub use heap::HeapPool;
pub use resource::{HeapUsage, Placement, ResourceDesc, ResourceHandle};
pub use sync::{QueueId, QueueKind, SyncPoint, Timeline};

pub use ash;

pub mod prelude {
    pub use crate::{
        Device, HasDevice, QueueId, QueueKind, SyncPoint,
        descriptor::DescriptorTable,
        heap::{Acquired, HeapPool},
        resource::{HeapUsage, ResourceDesc, ResourceHandle},
        staging::{CopyEngine, UploadReservation},
        submit::{Submission, Submitter},
        tracking::{Access, StateTable},
    };
}

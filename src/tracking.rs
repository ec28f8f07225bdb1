//! Resource state tracking and pipeline barrier coalescing.
//!
//! The [`StateTable`] remembers, per resource, the access state (and for
//! images the memory layout) the device last saw, and turns transition
//! requests into the minimal pending-barrier set: at most one pending,
//! already-merged transition per resource. [`StateTable::flush`] groups what
//! accumulated into batched transition groups — issued by the caller once,
//! immediately before any operation that would otherwise race a pending
//! barrier.
//!
//! The table enforces no legality graph on transitions: it is bookkeeping and
//! coalescing only, and callers are trusted to request legal transitions.
//! When a caller's declared "before" state disagrees with what the table
//! tracked, the mismatch is logged and the caller's value is kept.
//!
//! # Quick Start
//!
//! ```
//! use scoria::tracking::{Access, StateTable};
//! # use scoria::{Device, QueueKind, ResourceDesc, ash::vk, heap::{HeapPool, HeapPoolDesc}};
//! # let mut builder = Device::builder();
//! # let queue = builder.add_queue(QueueKind::Transfer);
//! # let device = builder.build();
//! # let pool = HeapPool::new(device, queue, HeapPoolDesc::default());
//! # let desc = ResourceDesc::buffer(1024, vk::BufferUsageFlags::STORAGE_BUFFER);
//! # let resource = pool.acquire(&desc, false).unwrap().handle;
//!
//! let mut table = StateTable::new();
//! table.register(resource, Access::COPY_DST, None);
//!
//! // Upload finished; the next consumer samples the resource.
//! table.transition(resource, Access::SHADER_READ, None);
//!
//! let batch = table.flush();
//! assert_eq!(batch.buffer.len(), 1);
//! assert!(table.is_empty());
//! ```

use std::collections::HashMap;

use ash::vk;
use smallvec::SmallVec;

use crate::resource::ResourceHandle;

/// How a resource is used: the pipeline stages that touch it and the access
/// mask they use. The stage half doubles as the barrier's sync scope.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    /// Fallback state usable by anything, at full-pipeline cost.
    pub const COMMON: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };
    pub const COPY_SRC: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_DST: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const SHADER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
                | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const UNORDERED_ACCESS: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
                | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
        ),
    };
    pub const RENDER_TARGET: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const DEPTH_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    };
    pub const PRESENT: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::NONE,
    };

    const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    );

    /// `true` if the access mask contains any write bits.
    pub fn is_writing(&self) -> bool {
        self.access.intersects(Self::ALL_WRITE_BITS)
    }
}

/// The tracked current state of one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    pub access: Access,
    /// Present for images only.
    pub layout: Option<vk::ImageLayout>,
}

/// One pending, already-merged transition.
///
/// A second request for the same resource before a flush amends the "after"
/// fields of the existing entry rather than appending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingBarrier {
    pub resource: ResourceHandle,
    pub access_before: Access,
    pub access_after: Access,
    pub layout_before: Option<vk::ImageLayout>,
    pub layout_after: Option<vk::ImageLayout>,
}

/// A full-queue transition with no specific resource attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GlobalBarrier {
    pub access_before: Access,
    pub access_after: Access,
}

/// Pending transitions grouped by category, ready to issue as one batch.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    pub global: Option<GlobalBarrier>,
    pub buffer: SmallVec<[PendingBarrier; 8]>,
    pub texture: SmallVec<[PendingBarrier; 8]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.buffer.is_empty() && self.texture.is_empty()
    }
}

/// Per-resource access/layout bookkeeping with pending-barrier coalescing.
///
/// Not internally locked: the submission layer owns one table per batch
/// domain and brackets access in its own short critical sections.
#[derive(Default)]
pub struct StateTable {
    states: HashMap<ResourceHandle, ResourceState>,
    pending: Vec<PendingBarrier>,
    pending_index: HashMap<ResourceHandle, usize>,
    global: Option<GlobalBarrier>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a resource at its initial state. Images carry a
    /// layout; buffers pass `None`.
    pub fn register(
        &mut self,
        resource: ResourceHandle,
        access: Access,
        layout: Option<vk::ImageLayout>,
    ) {
        let prev = self.states.insert(resource, ResourceState { access, layout });
        debug_assert!(prev.is_none(), "resource registered twice");
    }

    /// Stops tracking a released resource and drops any pending transition
    /// for it.
    pub fn forget(&mut self, resource: ResourceHandle) {
        let _ = self.states.remove(&resource);
        if let Some(at) = self.pending_index.remove(&resource) {
            let _ = self.pending.swap_remove(at);
            if let Some(moved) = self.pending.get(at) {
                let _ = self.pending_index.insert(moved.resource, at);
            }
        }
    }

    pub fn current(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.global.is_none()
    }

    /// Requests a transition using the tracked state as the "before" half.
    /// Untracked resources transition out of [`Access::NONE`].
    pub fn transition(
        &mut self,
        resource: ResourceHandle,
        after: Access,
        layout_after: Option<vk::ImageLayout>,
    ) {
        let before = self.current(resource).unwrap_or(ResourceState {
            access: Access::NONE,
            layout: None,
        });
        self.add_barrier(resource, before.access, after, before.layout, layout_after);
    }

    /// Queues a transition for `resource`, coalescing with any pending entry:
    /// the existing entry keeps its "before" fields and takes the new
    /// "after" fields, so back-to-back requests collapse into the single
    /// barrier the device actually needs.
    pub fn add_barrier(
        &mut self,
        resource: ResourceHandle,
        access_before: Access,
        access_after: Access,
        layout_before: Option<vk::ImageLayout>,
        layout_after: Option<vk::ImageLayout>,
    ) {
        if let Some(tracked) = self.current(resource) {
            if tracked.access != access_before || tracked.layout != layout_before {
                tracing::warn!(
                    ?resource,
                    ?tracked,
                    declared_access = ?access_before,
                    declared_layout = ?layout_before,
                    "barrier request disagrees with tracked state"
                );
            }
        }

        if let Some(&at) = self.pending_index.get(&resource) {
            let entry = &mut self.pending[at];
            entry.access_after = access_after;
            entry.layout_after = layout_after;
        } else {
            self.pending_index.insert(resource, self.pending.len());
            self.pending.push(PendingBarrier {
                resource,
                access_before,
                access_after,
                layout_before,
                layout_after,
            });
        }

        // Track the destination state immediately; the barrier is guaranteed
        // issued before anything that depends on it.
        let _ = self.states.insert(
            resource,
            ResourceState {
                access: access_after,
                layout: layout_after,
            },
        );
    }

    /// Queues a queue-wide transition. Consecutive requests amend the "after"
    /// half of the single global entry.
    pub fn add_global_barrier(&mut self, access_before: Access, access_after: Access) {
        match &mut self.global {
            Some(entry) => entry.access_after = access_after,
            None => {
                self.global = Some(GlobalBarrier {
                    access_before,
                    access_after,
                });
            }
        }
    }

    /// Drains the pending set into category-grouped transition batches.
    ///
    /// Entries carrying layouts are texture transitions; the rest are buffer
    /// transitions. Tracked current states are unaffected — they already
    /// reflect the "after" side of everything drained.
    pub fn flush(&mut self) -> BarrierBatch {
        let mut batch = BarrierBatch {
            global: self.global.take(),
            ..Default::default()
        };
        self.pending_index.clear();
        for barrier in self.pending.drain(..) {
            if barrier.layout_before.is_some() || barrier.layout_after.is_some() {
                batch.texture.push(barrier);
            } else {
                batch.buffer.push(barrier);
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> ResourceHandle {
        ResourceHandle {
            index,
            generation: 0,
        }
    }

    /// Two consecutive requests before a flush produce exactly one coalesced
    /// entry whose "after" state reflects only the second call.
    #[test]
    fn consecutive_requests_coalesce_into_one_entry() {
        let mut table = StateTable::new();
        let res = handle(1);
        table.register(res, Access::COPY_DST, None);

        table.transition(res, Access::SHADER_READ, None);
        table.transition(res, Access::UNORDERED_ACCESS, None);

        let batch = table.flush();
        assert_eq!(batch.buffer.len(), 1);
        let entry = batch.buffer[0];
        assert_eq!(entry.access_before, Access::COPY_DST);
        assert_eq!(entry.access_after, Access::UNORDERED_ACCESS);
        assert!(batch.texture.is_empty());
        assert!(batch.global.is_none());
    }

    #[test]
    fn flush_groups_by_category_and_clears() {
        let mut table = StateTable::new();
        let buf = handle(1);
        let img = handle(2);
        table.register(buf, Access::COPY_DST, None);
        table.register(img, Access::COPY_DST, Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL));

        table.transition(buf, Access::SHADER_READ, None);
        table.transition(
            img,
            Access::SHADER_READ,
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
        table.add_global_barrier(Access::UNORDERED_ACCESS, Access::UNORDERED_ACCESS);

        let batch = table.flush();
        assert_eq!(batch.buffer.len(), 1);
        assert_eq!(batch.texture.len(), 1);
        assert_eq!(batch.texture[0].layout_before, Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL));
        assert_eq!(
            batch.texture[0].layout_after,
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert!(batch.global.is_some());
        assert!(table.is_empty());
        assert!(table.flush().is_empty());
    }

    #[test]
    fn tracked_state_follows_the_latest_request() {
        let mut table = StateTable::new();
        let res = handle(3);
        table.register(res, Access::COPY_DST, None);
        table.transition(res, Access::SHADER_READ, None);
        assert_eq!(
            table.current(res).unwrap().access,
            Access::SHADER_READ
        );

        // After a flush the next transition starts from the flushed state.
        let _ = table.flush();
        table.transition(res, Access::COPY_SRC, None);
        let batch = table.flush();
        assert_eq!(batch.buffer[0].access_before, Access::SHADER_READ);
        assert_eq!(batch.buffer[0].access_after, Access::COPY_SRC);
    }

    /// The table is bookkeeping only: a mismatched "before" is kept verbatim,
    /// not rejected.
    #[test]
    fn mismatched_before_state_is_trusted() {
        let mut table = StateTable::new();
        let res = handle(4);
        table.register(res, Access::COPY_DST, None);
        table.add_barrier(res, Access::RENDER_TARGET, Access::PRESENT, None, None);
        let batch = table.flush();
        assert_eq!(batch.buffer[0].access_before, Access::RENDER_TARGET);
        assert_eq!(batch.buffer[0].access_after, Access::PRESENT);
    }

    #[test]
    fn forget_drops_the_pending_entry() {
        let mut table = StateTable::new();
        let a = handle(5);
        let b = handle(6);
        table.register(a, Access::COPY_DST, None);
        table.register(b, Access::COPY_DST, None);
        table.transition(a, Access::SHADER_READ, None);
        table.transition(b, Access::SHADER_READ, None);

        table.forget(a);
        let batch = table.flush();
        assert_eq!(batch.buffer.len(), 1);
        assert_eq!(batch.buffer[0].resource, b);
        assert!(table.current(a).is_none());
    }

    #[test]
    fn writes_are_recognized() {
        assert!(Access::COPY_DST.is_writing());
        assert!(Access::RENDER_TARGET.is_writing());
        assert!(Access::UNORDERED_ACCESS.is_writing());
        assert!(!Access::SHADER_READ.is_writing());
        assert!(!Access::PRESENT.is_writing());
    }
}

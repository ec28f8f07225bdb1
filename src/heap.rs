//! Block-granular placement inside fixed-capacity device memory heaps.
//!
//! A [`HeapPool`] owns one or more fixed-size heaps, each divided into
//! equally sized blocks, and serves "allocate N bytes with these usage flags"
//! requests by finding a contiguous block run and returning a resource placed
//! at that offset. Pools are created per resource category (render targets,
//! unordered-access buffers, plain resources) so categories never contend.
//!
//! # Reuse Gating
//!
//! Freed ranges come back as `Locked`, tagged with the sync value active at
//! release. A locked range only becomes allocatable once the queue's
//! completed counter passes that value — reuse is decided by comparing
//! counters at the moment of allocation, never by convention at release time.
//!
//! # Exhaustion
//!
//! When no sufficient run exists the pool coalesces adjacent elapsed ranges
//! and retries once; if that still fails it stalls the device idle — a
//! deliberate last resort — coalesces again and retries. Failure after the
//! stall is reported as a hard capacity error.
//!
//! # Transient Aliasing
//!
//! Resources acquired as `temporary` support frame-to-frame scratch reuse:
//! re-acquiring the same block count while the old range is still in flight
//! returns the prior occupant's handle alongside the new resource (the
//! "overlap handle"), so the caller can sequence its own barriers against the
//! aliased predecessor. [`HeapPool::recycle`] offers the same in-place reuse
//! for explicitly chosen handles.

use ash::vk;
use parking_lot::Mutex;
use smallvec::smallvec;

use crate::{
    Device, HasDevice,
    error::{Error, Result},
    resource::{HeapHandle, HeapUsage, Placement, Placements, ResourceDesc, ResourceHandle},
    sync::{QueueId, SyncPoint},
};

/// Static configuration of a [`HeapPool`].
#[derive(Clone, Debug)]
pub struct HeapPoolDesc {
    /// Allocation granule. Every placement is a whole number of blocks.
    pub block_size: vk::DeviceSize,
    pub blocks_per_heap: u32,
    pub heap_count: u32,
    /// Resource categories this pool's heaps may back.
    pub usage: HeapUsage,
    /// Physical copies created for CPU-writable resources (clamped to 1..=3).
    pub frames_in_flight: u32,
}

impl Default for HeapPoolDesc {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            blocks_per_heap: 256,
            heap_count: 1,
            usage: HeapUsage::BUFFER,
            frames_in_flight: 2,
        }
    }
}

/// Result of a successful [`HeapPool::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub handle: ResourceHandle,
    /// The prior occupant of the same blocks, present when a temporary range
    /// was re-acquired before its fence elapsed. The pool slot behind it is
    /// already retired; the id only tells the caller which resource the new
    /// one aliases.
    pub overlap: Option<ResourceHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeState {
    /// Never used, or elapsed and merged. Immediately allocatable.
    Clear,
    /// Freed but possibly still read by the device; allocatable once the
    /// completed counter passes `frame_id`.
    Locked,
    /// Like `Locked`, but additionally eligible for exact-size aliasing
    /// before the fence elapses.
    Temporary,
}

/// A free run of blocks. Ranges in a heap's free list are pairwise disjoint
/// and sorted by offset.
#[derive(Clone, Debug)]
struct FreeRange {
    offset: u32,
    count: u32,
    state: RangeState,
    /// Sync value gating reuse for `Locked`/`Temporary` ranges.
    frame_id: u64,
    /// Previous occupant, kept addressable for recycling and overlap returns.
    prior: Option<ResourceHandle>,
}

struct Heap {
    free: Vec<FreeRange>,
}

struct Occupant {
    placements: Placements,
    temporary: bool,
    /// Set once released; the slot then only backs `prior` references from
    /// the free list.
    released: bool,
    label: Option<String>,
}

struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

struct PoolState {
    heaps: Vec<Heap>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
}

/// Counters for capacity inspection and invariant checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub total_blocks: u32,
    /// Blocks on free lists, including locked ones not yet reusable.
    pub free_blocks: u32,
    /// Blocks owned by live (not yet released) resources.
    pub allocated_blocks: u32,
    /// Free blocks allocatable at the given completed counter.
    pub reusable_blocks: u32,
}

/// The block pool allocator over a set of fixed-capacity heaps.
///
/// Thread-safe; the internal mutex is held only for the duration of one
/// allocate/release call.
pub struct HeapPool {
    device: Device,
    queue: QueueId,
    desc: HeapPoolDesc,
    state: Mutex<PoolState>,
}

impl HasDevice for HeapPool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl HeapPool {
    pub fn new(device: Device, queue: QueueId, desc: HeapPoolDesc) -> Self {
        assert!(desc.block_size > 0 && desc.blocks_per_heap > 0 && desc.heap_count > 0);
        let heaps = (0..desc.heap_count)
            .map(|_| Heap {
                free: vec![FreeRange {
                    offset: 0,
                    count: desc.blocks_per_heap,
                    state: RangeState::Clear,
                    frame_id: 0,
                    prior: None,
                }],
            })
            .collect();
        Self {
            device,
            queue,
            desc: HeapPoolDesc {
                frames_in_flight: desc.frames_in_flight.clamp(1, 3),
                ..desc
            },
            state: Mutex::new(PoolState {
                heaps,
                slots: Vec::new(),
                free_slots: Vec::new(),
            }),
        }
    }

    pub fn block_size(&self) -> vk::DeviceSize {
        self.desc.block_size
    }

    /// Blocks needed for one physical copy of `desc`.
    fn blocks_for(&self, desc: &ResourceDesc) -> u32 {
        let blocks = desc.size_bytes().div_ceil(self.desc.block_size).max(1);
        u32::try_from(blocks).unwrap_or(u32::MAX)
    }

    /// Allocates a resource, placing each physical copy in a contiguous block
    /// run. Fails only if, after coalescing and a forced device-idle stall,
    /// no sufficient run exists.
    pub fn acquire(&self, desc: &ResourceDesc, temporary: bool) -> Result<Acquired> {
        self.device.ensure_alive(desc.label())?;
        if !self.desc.usage.contains(desc.category) {
            return Err(Error::UsageMismatch {
                requested: desc.category,
                allowed: self.desc.usage,
            });
        }
        let blocks = self.blocks_for(desc);
        let copies = if desc.cpu_writable {
            self.desc.frames_in_flight as usize
        } else {
            1
        };
        // Aliasing only applies to single-copy scratch resources.
        let allow_overlap = temporary && copies == 1;

        let mut state = self.state.lock();
        let mut completed = self.device.queue(self.queue).completed_value();
        for attempt in 0.. {
            if let Some(acquired) =
                Self::try_place(&mut state, desc, blocks, copies, completed, temporary, allow_overlap)
            {
                return Ok(acquired);
            }
            match attempt {
                0 => Self::coalesce_ranges(&mut state, completed),
                1 => {
                    // Last resort: guarantee forward progress by draining the
                    // device, then fold everything that elapsed.
                    tracing::warn!(
                        requested_blocks = blocks,
                        copies,
                        "heap pool exhausted, stalling device"
                    );
                    drop(state);
                    self.device.wait_idle();
                    state = self.state.lock();
                    completed = self.device.queue(self.queue).completed_value();
                    Self::coalesce_ranges(&mut state, completed);
                }
                _ => break,
            }
        }
        let stats = Self::stats_locked(&state, &self.desc, completed);
        Err(Error::OutOfHeapMemory {
            requested_blocks: blocks,
            free_blocks: stats.reusable_blocks,
            total_blocks: stats.total_blocks,
        })
    }

    /// Returns the handle's blocks to the free list as `Locked` (or
    /// `Temporary` for scratch resources), gated on `sync`. The physical
    /// range stays unusable until the queue completes past that point.
    pub fn release(&self, handle: ResourceHandle, sync: SyncPoint) -> Result<()> {
        debug_assert_eq!(sync.queue, self.queue, "release gated on a foreign queue");
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation {
            return Err(Error::InvalidHandle);
        }
        let occupant = slot.occupant.as_ref().ok_or(Error::InvalidHandle)?;
        if occupant.released {
            return Err(Error::InvalidHandle);
        }

        let placements = occupant.placements.clone();
        let range_state = if occupant.temporary {
            RangeState::Temporary
        } else {
            RangeState::Locked
        };
        // Only single-copy resources stay addressable for recycling; the
        // slot of a multi-copy resource is retired immediately.
        let prior = (placements.len() == 1).then_some(handle);
        for placement in &placements {
            Self::insert_range(
                &mut state.heaps[placement.heap.index()],
                FreeRange {
                    offset: placement.first_block,
                    count: placement.block_count,
                    state: range_state,
                    frame_id: sync.value,
                    prior,
                },
            );
        }
        if prior.is_some() {
            state.slots[handle.index as usize]
                .occupant
                .as_mut()
                .unwrap()
                .released = true;
        } else {
            Self::retire_slot(&mut state, handle.index);
        }
        Ok(())
    }

    /// Reuses a released handle's block run in place for a same-size-class
    /// resource, skipping the free-range search. The range's lock is
    /// deliberately ignored — aliasing across frames is the caller's opt-in.
    pub fn recycle(&self, old: ResourceHandle, new_desc: &ResourceDesc) -> Result<ResourceHandle> {
        self.device.ensure_alive(new_desc.label())?;
        if !self.desc.usage.contains(new_desc.category) {
            return Err(Error::UsageMismatch {
                requested: new_desc.category,
                allowed: self.desc.usage,
            });
        }
        let blocks = self.blocks_for(new_desc);

        let mut state = self.state.lock();
        let slot = state
            .slots
            .get(old.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != old.generation
            || !slot.occupant.as_ref().is_some_and(|o| o.released)
        {
            return Err(Error::InvalidHandle);
        }

        let (heap_idx, range_idx) = state
            .heaps
            .iter()
            .enumerate()
            .find_map(|(h, heap)| {
                heap.free
                    .iter()
                    .position(|r| r.prior == Some(old))
                    .map(|r| (h, r))
            })
            .ok_or(Error::InvalidHandle)?;
        let range = state.heaps[heap_idx].free[range_idx].clone();
        if range.count != blocks {
            return Err(Error::RecycleMismatch {
                requested_blocks: blocks,
                available_blocks: range.count,
            });
        }

        let _ = state.heaps[heap_idx].free.remove(range_idx);
        Self::retire_slot(&mut state, old.index);
        let placement = Placement {
            heap: HeapHandle(heap_idx as u32),
            first_block: range.offset,
            block_count: range.count,
        };
        Ok(Self::occupy(&mut state, new_desc, smallvec![placement], false))
    }

    /// Merges adjacent elapsed ranges at the current completed counter.
    /// Runs automatically on the exhaustion path; exposed for maintenance
    /// sweeps between frames.
    pub fn coalesce(&self) {
        let completed = self.device.queue(self.queue).completed_value();
        Self::coalesce_ranges(&mut self.state.lock(), completed);
    }

    /// The handle's physical placements, one per frame copy.
    pub fn placements(&self, handle: ResourceHandle) -> Result<Placements> {
        let state = self.state.lock();
        let slot = state
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation {
            return Err(Error::InvalidHandle);
        }
        match &slot.occupant {
            Some(o) if !o.released => Ok(o.placements.clone()),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// The debug label the resource was created with, for frontends naming
    /// their API objects and for loss diagnostics.
    pub fn debug_label(&self, handle: ResourceHandle) -> Result<Option<String>> {
        let state = self.state.lock();
        let slot = state
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation {
            return Err(Error::InvalidHandle);
        }
        match &slot.occupant {
            Some(o) => Ok(o.label.clone()),
            None => Err(Error::InvalidHandle),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let completed = self.device.queue(self.queue).completed_value();
        Self::stats_locked(&self.state.lock(), &self.desc, completed)
    }

    fn stats_locked(state: &PoolState, desc: &HeapPoolDesc, completed: u64) -> PoolStats {
        let free_blocks: u32 = state
            .heaps
            .iter()
            .flat_map(|h| h.free.iter())
            .map(|r| r.count)
            .sum();
        let reusable_blocks: u32 = state
            .heaps
            .iter()
            .flat_map(|h| h.free.iter())
            .filter(|r| r.state == RangeState::Clear || r.frame_id <= completed)
            .map(|r| r.count)
            .sum();
        let allocated_blocks: u32 = state
            .slots
            .iter()
            .filter_map(|s| s.occupant.as_ref())
            .filter(|o| !o.released)
            .flat_map(|o| o.placements.iter())
            .map(|p| p.block_count)
            .sum();
        PoolStats {
            total_blocks: desc.blocks_per_heap * desc.heap_count,
            free_blocks,
            allocated_blocks,
            reusable_blocks,
        }
    }

    fn try_place(
        state: &mut PoolState,
        desc: &ResourceDesc,
        blocks: u32,
        copies: usize,
        completed: u64,
        temporary: bool,
        allow_overlap: bool,
    ) -> Option<Acquired> {
        let mut placements: Placements = Placements::new();
        let mut overlap = None;
        for _ in 0..copies {
            match Self::take_best(state, blocks, completed, allow_overlap) {
                Some((placement, prior)) => {
                    overlap = overlap.or(prior);
                    placements.push(placement);
                }
                None => {
                    // Roll back partial progress; consumed ranges were
                    // allocatable, so reinserting them Clear is exact enough.
                    for placement in placements {
                        Self::insert_range(
                            &mut state.heaps[placement.heap.index()],
                            FreeRange {
                                offset: placement.first_block,
                                count: placement.block_count,
                                state: RangeState::Clear,
                                frame_id: 0,
                                prior: None,
                            },
                        );
                    }
                    return None;
                }
            }
        }
        let handle = Self::occupy(state, desc, placements, temporary);
        Some(Acquired { handle, overlap })
    }

    /// Best-candidate scan over every heap's free list.
    ///
    /// The composite priority (aliasing eligibility, lock state, frame id,
    /// block count) is a fragmentation tunable, not a contract; only the
    /// gating is: a locked range whose frame id has not elapsed is never
    /// taken, except for the explicit exact-size aliasing of temporary
    /// ranges.
    fn take_best(
        state: &mut PoolState,
        blocks: u32,
        completed: u64,
        allow_overlap: bool,
    ) -> Option<(Placement, Option<ResourceHandle>)> {
        let mut best: Option<((u8, u64, u32), (usize, usize))> = None;
        for (h, heap) in state.heaps.iter().enumerate() {
            for (r, range) in heap.free.iter().enumerate() {
                if range.count < blocks {
                    continue;
                }
                let elapsed = range.frame_id <= completed;
                let rank = match range.state {
                    RangeState::Temporary
                        if !elapsed && allow_overlap && range.count == blocks =>
                    {
                        0
                    }
                    RangeState::Clear => 1,
                    _ if elapsed => 2,
                    _ => continue,
                };
                let key = (rank, range.frame_id, range.count);
                if best.as_ref().is_none_or(|(k, _)| key < *k) {
                    best = Some((key, (h, r)));
                }
            }
        }
        let (_, (h, r)) = best?;
        let range = state.heaps[h].free.remove(r);
        let aliased = range.state == RangeState::Temporary && range.frame_id > completed;
        let mut overlap = None;
        if let Some(prior) = range.prior {
            if aliased {
                overlap = Some(prior);
            }
            Self::retire_slot(state, prior.index);
        }
        if range.count > blocks {
            // Remainder keeps its reuse gate; the prior association is gone
            // once the run is split.
            Self::insert_range(
                &mut state.heaps[h],
                FreeRange {
                    offset: range.offset + blocks,
                    count: range.count - blocks,
                    state: range.state,
                    frame_id: range.frame_id,
                    prior: None,
                },
            );
        }
        Some((
            Placement {
                heap: HeapHandle(h as u32),
                first_block: range.offset,
                block_count: blocks,
            },
            overlap,
        ))
    }

    fn coalesce_ranges(state: &mut PoolState, completed: u64) {
        let mut retire = Vec::new();
        for heap in &mut state.heaps {
            for range in &mut heap.free {
                if range.state != RangeState::Clear && range.frame_id <= completed {
                    range.state = RangeState::Clear;
                    range.frame_id = 0;
                    if let Some(prior) = range.prior.take() {
                        retire.push(prior.index);
                    }
                }
            }
            let mut merged: Vec<FreeRange> = Vec::with_capacity(heap.free.len());
            for range in heap.free.drain(..) {
                match merged.last_mut() {
                    Some(last)
                        if last.state == RangeState::Clear
                            && range.state == RangeState::Clear
                            && last.offset + last.count == range.offset =>
                    {
                        last.count += range.count;
                    }
                    _ => merged.push(range),
                }
            }
            heap.free = merged;
        }
        for index in retire {
            Self::retire_slot(state, index);
        }
    }

    fn insert_range(heap: &mut Heap, range: FreeRange) {
        let at = heap
            .free
            .partition_point(|r| r.offset < range.offset);
        debug_assert!(
            at == 0 || heap.free[at - 1].offset + heap.free[at - 1].count <= range.offset
        );
        debug_assert!(at == heap.free.len() || range.offset + range.count <= heap.free[at].offset);
        heap.free.insert(at, range);
    }

    fn occupy(
        state: &mut PoolState,
        desc: &ResourceDesc,
        placements: Placements,
        temporary: bool,
    ) -> ResourceHandle {
        let occupant = Occupant {
            placements,
            temporary,
            released: false,
            label: desc.label.clone(),
        };
        if let Some(index) = state.free_slots.pop() {
            let slot = &mut state.slots[index as usize];
            slot.occupant = Some(occupant);
            ResourceHandle {
                index,
                generation: slot.generation,
            }
        } else {
            state.slots.push(Slot {
                generation: 0,
                occupant: Some(occupant),
            });
            ResourceHandle {
                index: (state.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn retire_slot(state: &mut PoolState, index: u32) {
        let slot = &mut state.slots[index as usize];
        if slot.occupant.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            state.free_slots.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::QueueKind;

    fn pool_16_blocks() -> (Device, HeapPool, QueueId) {
        let mut builder = Device::builder();
        let queue = builder.add_queue(QueueKind::Graphics);
        let device = builder.build();
        let pool = HeapPool::new(
            device.clone(),
            queue,
            HeapPoolDesc {
                block_size: 64 * 1024,
                blocks_per_heap: 16,
                heap_count: 1,
                usage: HeapUsage::BUFFER,
                frames_in_flight: 2,
            },
        );
        (device, pool, queue)
    }

    fn buffer_blocks(blocks: u32) -> ResourceDesc {
        ResourceDesc::buffer(blocks as u64 * 64 * 1024, vk::BufferUsageFlags::STORAGE_BUFFER)
    }

    fn assert_conserved(pool: &HeapPool) {
        let stats = pool.stats();
        assert_eq!(
            stats.free_blocks + stats.allocated_blocks,
            stats.total_blocks,
            "block conservation violated: {stats:?}"
        );
    }

    #[test]
    fn blocks_are_conserved_through_acquire_and_release() {
        let (device, pool, queue) = pool_16_blocks();
        assert_conserved(&pool);
        let a = pool.acquire(&buffer_blocks(5), false).unwrap();
        let b = pool.acquire(&buffer_blocks(3), false).unwrap();
        assert_conserved(&pool);
        assert_eq!(pool.stats().allocated_blocks, 8);

        let sync = device.queue(queue).ticket();
        pool.release(a.handle, sync).unwrap();
        assert_conserved(&pool);
        assert_eq!(pool.stats().allocated_blocks, 3);

        device.queue(queue).signal(sync.value);
        pool.coalesce();
        assert_conserved(&pool);
        pool.release(b.handle, device.queue(queue).ticket()).unwrap();
        assert_conserved(&pool);
        assert_eq!(pool.stats().allocated_blocks, 0);
    }

    /// A freed-but-unfenced range must never be handed out again; the request
    /// is served from the remaining clear blocks instead.
    #[test]
    fn locked_range_stays_unusable_until_fence() {
        let (device, pool, queue) = pool_16_blocks();
        let first = pool.acquire(&buffer_blocks(5), false).unwrap();
        let _second = pool.acquire(&buffer_blocks(5), false).unwrap();

        let frame1 = device.queue(queue).ticket();
        pool.release(first.handle, frame1).unwrap();

        // Frame 1 has not completed; the freed run at offset 0 is locked.
        let third = pool.acquire(&buffer_blocks(5), false).unwrap();
        let placement = pool.placements(third.handle).unwrap()[0];
        assert_eq!(placement.first_block, 10, "locked range was double-allocated");
        assert_conserved(&pool);

        // Once the fence is reached the locked run becomes allocatable.
        device.queue(queue).signal(frame1.value);
        let fourth = pool.acquire(&buffer_blocks(5), false).unwrap();
        assert_eq!(pool.placements(fourth.handle).unwrap()[0].first_block, 0);
    }

    #[test]
    fn coalesce_leaves_no_adjacent_clear_ranges() {
        let (device, pool, queue) = pool_16_blocks();
        let a = pool.acquire(&buffer_blocks(4), false).unwrap();
        let b = pool.acquire(&buffer_blocks(4), false).unwrap();
        let sync_a = device.queue(queue).ticket();
        let sync_b = device.queue(queue).ticket();
        pool.release(a.handle, sync_a).unwrap();
        pool.release(b.handle, sync_b).unwrap();

        device.queue(queue).signal(sync_b.value);
        pool.coalesce();

        let state = pool.state.lock();
        let free = &state.heaps[0].free;
        assert!(
            free.windows(2).all(|w| {
                !(w[0].state == RangeState::Clear
                    && w[1].state == RangeState::Clear
                    && w[0].offset + w[0].count == w[1].offset)
            }),
            "adjacent clear ranges left unmerged: {free:?}"
        );
        // [0..8) merged with the original tail [8..16).
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].count, 16);
    }

    /// Exhaustion first stalls the device; once the stall lets pending work
    /// complete, the coalesced space satisfies the request.
    #[test]
    fn forced_wait_recovers_when_fences_land() {
        let (device, pool, queue) = pool_16_blocks();
        let a = pool.acquire(&buffer_blocks(10), false).unwrap();
        let sync = device.queue(queue).ticket();
        pool.release(a.handle, sync).unwrap();

        let signaler = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                device.queue(sync.queue).signal(sync.value);
            })
        };
        // 12 contiguous blocks only exist once the locked 10 elapse and merge
        // with the clear tail.
        let big = pool.acquire(&buffer_blocks(12), false).unwrap();
        signaler.join().unwrap();
        assert_eq!(pool.placements(big.handle).unwrap()[0].block_count, 12);
        assert_conserved(&pool);
    }

    #[test]
    fn post_stall_exhaustion_is_fatal() {
        let (_device, pool, _queue) = pool_16_blocks();
        let _a = pool.acquire(&buffer_blocks(6), false).unwrap();
        let _b = pool.acquire(&buffer_blocks(6), false).unwrap();
        match pool.acquire(&buffer_blocks(5), false) {
            Err(Error::OutOfHeapMemory {
                requested_blocks: 5,
                free_blocks: 4,
                total_blocks: 16,
            }) => {}
            other => panic!("expected hard exhaustion, got {other:?}"),
        }
        assert_conserved(&pool);
    }

    #[test]
    fn recycle_reuses_the_same_blocks_in_place() {
        let (device, pool, queue) = pool_16_blocks();
        let old = pool.acquire(&buffer_blocks(4), false).unwrap();
        let old_placement = pool.placements(old.handle).unwrap()[0];
        let sync = device.queue(queue).ticket();
        pool.release(old.handle, sync).unwrap();

        // The fence has not elapsed; recycling aliases across frames anyway.
        let new = pool
            .recycle(old.handle, &buffer_blocks(4).with_label("reused scratch"))
            .unwrap();
        assert_eq!(pool.placements(new).unwrap()[0], old_placement);
        assert!(pool.placements(old.handle).is_err());
        assert_conserved(&pool);
    }

    #[test]
    fn recycle_rejects_a_different_size_class() {
        let (device, pool, queue) = pool_16_blocks();
        let old = pool.acquire(&buffer_blocks(4), false).unwrap();
        pool.release(old.handle, device.queue(queue).ticket()).unwrap();
        match pool.recycle(old.handle, &buffer_blocks(6)) {
            Err(Error::RecycleMismatch {
                requested_blocks: 6,
                available_blocks: 4,
            }) => {}
            other => panic!("expected size-class mismatch, got {other:?}"),
        }
    }

    #[test]
    fn temporary_reacquisition_returns_the_overlap_handle() {
        let (device, pool, queue) = pool_16_blocks();
        let scratch = pool.acquire(&buffer_blocks(4), true).unwrap();
        assert_eq!(scratch.overlap, None);
        let placement = pool.placements(scratch.handle).unwrap()[0];

        let sync = device.queue(queue).ticket();
        pool.release(scratch.handle, sync).unwrap();

        // Same size, still in flight: alias the old scratch instead of
        // searching for fresh space.
        let next = pool.acquire(&buffer_blocks(4), true).unwrap();
        assert_eq!(next.overlap, Some(scratch.handle));
        assert_eq!(pool.placements(next.handle).unwrap()[0], placement);
        assert_conserved(&pool);
    }

    #[test]
    fn cpu_writable_resources_get_per_frame_copies() {
        let (_device, pool, _queue) = pool_16_blocks();
        let desc = buffer_blocks(3).with_cpu_writable();
        let res = pool.acquire(&desc, false).unwrap();
        let placements = pool.placements(res.handle).unwrap();
        assert_eq!(placements.len(), 2);
        assert_ne!(placements[0].first_block, placements[1].first_block);
        assert_eq!(pool.stats().allocated_blocks, 6);
        assert_conserved(&pool);
    }

    #[test]
    fn wrong_category_is_rejected() {
        let (_device, pool, _queue) = pool_16_blocks();
        let desc = buffer_blocks(1).with_category(HeapUsage::RENDER_TARGET);
        assert!(matches!(
            pool.acquire(&desc, false),
            Err(Error::UsageMismatch { .. })
        ));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (device, pool, queue) = pool_16_blocks();
        let a = pool.acquire(&buffer_blocks(2), false).unwrap();
        let sync = device.queue(queue).ticket();
        pool.release(a.handle, sync).unwrap();
        assert_eq!(pool.release(a.handle, sync), Err(Error::InvalidHandle));
        assert!(pool.placements(a.handle).is_err());
    }
}

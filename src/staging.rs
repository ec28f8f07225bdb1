//! CPU-writable staging memory and the upload machinery around it.
//!
//! All application data reaches device-resident resources through here: a
//! [`CopyEngine`] owns N parallel copy contexts, each with its own growable
//! ring buffer, so worker threads staging uploads never contend on one
//! cursor. Backing memory is host-allocated and page-aligned; integrations
//! hand it to the device as imported host memory or mirror it through a
//! persistently mapped upload buffer.
//!
//! # Ring Semantics
//!
//! Each ring tracks a write cursor (`position`) and the end of the last
//! submitted region (`last`). A reservation is placed in one of three ways,
//! tried in order:
//!
//! 1. in place, between `position` and the end of the buffer;
//! 2. wrapped to offset 0, when the wrapped run would not cross unconsumed
//!    data — a reservation never straddles the wrap point;
//! 3. after doubling the buffer, with the old backing handed to deferred
//!    release. Exceeding the configured ceiling is fatal: staging is
//!    mandatory for every upload.
//!
//! # Ordering
//!
//! A reservation is writable the moment it is returned, but only guaranteed
//! consumed once its batch's fence is reached. Opening a context first waits
//! on that context's own prior fence; submitting a set of contexts closes
//! them under one shared fence value that downstream reuse (heap release,
//! descriptor locks) keys off as well.

use std::{
    alloc::{Layout, alloc, dealloc, handle_alloc_error},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    Device, HasDevice,
    error::{Error, Result},
    resource::ResourceHandle,
    sync::{QueueId, SyncPoint},
};

const STAGING_ALIGN: usize = 4096;

static NEXT_BACKING_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of one staging backing buffer, stable across its lifetime.
/// The frontend maps ids to the API objects it created for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StagingBufferId(u64);

/// One page-aligned host allocation backing a ring.
struct StagingChunk {
    id: StagingBufferId,
    ptr: NonNull<u8>,
    size: u64,
    layout: Layout,
}

// The chunk hands out disjoint byte ranges; the allocation itself is plain
// host memory.
unsafe impl Send for StagingChunk {}
unsafe impl Sync for StagingChunk {}

impl StagingChunk {
    fn new(size: u64) -> Arc<Self> {
        let layout = Layout::from_size_align(size as usize, STAGING_ALIGN)
            .expect("staging chunk layout");
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Arc::new(Self {
            id: StagingBufferId(NEXT_BACKING_ID.fetch_add(1, Ordering::Relaxed)),
            ptr,
            size,
            layout,
        })
    }
}

impl Drop for StagingChunk {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A writable slice of staging memory.
///
/// Valid until the owning copy context submits; the backing chunk is kept
/// alive by the reservation itself and, after submission, by the deferred
/// release queue until the batch's fence lands.
pub struct UploadReservation {
    buffer: StagingBufferId,
    offset: u64,
    size: u64,
    ptr: *mut u8,
    _chunk: Arc<StagingChunk>,
}

unsafe impl Send for UploadReservation {}
unsafe impl Sync for UploadReservation {}

impl std::fmt::Debug for UploadReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadReservation")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl UploadReservation {
    pub fn buffer(&self) -> StagingBufferId {
        self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The reserved bytes. Reservations never overlap, so each sees an
    /// exclusive slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }

    /// Copies `data` to the front of the reservation.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the reserved size.
    pub fn write(&mut self, data: &[u8]) {
        self.bytes_mut()[..data.len()].copy_from_slice(data);
    }
}

/// A copy recorded against a staging reservation, to be executed by the
/// frontend after the batch's barriers are flushed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyCommand {
    Buffer {
        src: StagingBufferId,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Image {
        src: StagingBufferId,
        src_offset: u64,
        dst: ResourceHandle,
        mip_level: u32,
        array_layer: u32,
        extent: vk::Extent3D,
    },
}

impl CopyCommand {
    pub fn dst(&self) -> ResourceHandle {
        match *self {
            CopyCommand::Buffer { dst, .. } | CopyCommand::Image { dst, .. } => dst,
        }
    }
}

struct RingState {
    chunk: Arc<StagingChunk>,
    position: u64,
    last: u64,
    wrapped: bool,
    /// Old backings with submitted-but-unfenced data, retired at the next
    /// submit.
    outgrown: Vec<Arc<StagingChunk>>,
}

struct CopyContext {
    ring: RingState,
    commands: Vec<CopyCommand>,
    fence: Option<SyncPoint>,
}

/// Configuration of a [`CopyEngine`].
#[derive(Clone, Debug)]
pub struct CopyEngineDesc {
    pub contexts: usize,
    pub initial_size: u64,
    /// Growth ceiling per context. Requests that cannot fit even after
    /// growing to this size fail hard.
    pub max_size: u64,
}

impl Default for CopyEngineDesc {
    fn default() -> Self {
        Self {
            contexts: 2,
            initial_size: 4 * 1024 * 1024,
            max_size: 256 * 1024 * 1024,
        }
    }
}

/// The upload queue: parallel copy contexts feeding one command queue.
pub struct CopyEngine {
    device: Device,
    queue: QueueId,
    desc: CopyEngineDesc,
    contexts: Vec<Mutex<CopyContext>>,
    next_context: AtomicUsize,
}

impl HasDevice for CopyEngine {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl CopyEngine {
    pub fn new(device: Device, queue: QueueId, desc: CopyEngineDesc) -> Self {
        assert!(desc.contexts > 0 && desc.initial_size > 0);
        assert!(desc.initial_size <= desc.max_size);
        let contexts = (0..desc.contexts)
            .map(|_| {
                Mutex::new(CopyContext {
                    ring: RingState {
                        chunk: StagingChunk::new(desc.initial_size),
                        position: 0,
                        last: 0,
                        wrapped: false,
                        outgrown: Vec::new(),
                    },
                    commands: Vec::new(),
                    fence: None,
                })
            })
            .collect();
        Self {
            device,
            queue,
            desc,
            contexts,
            next_context: AtomicUsize::new(0),
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Opens the next copy context for recording, waiting on that context's
    /// own prior completion fence first.
    pub fn open(&self) -> Result<CopyPass<'_>> {
        self.device.ensure_alive(None)?;
        let index = self.next_context.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        let ctx = self.contexts[index].lock();
        if let Some(fence) = ctx.fence {
            self.device.queue(fence.queue).wait(fence.value);
        }
        Ok(CopyPass { engine: self, ctx })
    }

    /// Closes a set of contexts and stamps them with one shared fence value.
    ///
    /// Returns the reserved sync point and the recorded copies, in context
    /// order, for the frontend to execute. Reuse of everything the batch
    /// touched keys off the same sync point.
    pub fn submit(&self, passes: Vec<CopyPass<'_>>) -> (SyncPoint, Vec<CopyCommand>) {
        let sync = self.device.queue(self.queue).ticket();
        (sync, self.submit_at(sync, passes))
    }

    /// [`submit`](Self::submit) under a fence value the caller already
    /// reserved, so uploads share their batch's sync point.
    pub fn submit_at(&self, sync: SyncPoint, passes: Vec<CopyPass<'_>>) -> Vec<CopyCommand> {
        let mut commands = Vec::new();
        for mut pass in passes {
            let ctx = &mut *pass.ctx;
            ctx.fence = Some(sync);
            ctx.ring.last = ctx.ring.position;
            ctx.ring.wrapped = false;
            for chunk in ctx.ring.outgrown.drain(..) {
                self.device.schedule_deferred_release(sync, chunk);
            }
            commands.append(&mut ctx.commands);
        }
        commands
    }

    pub(crate) fn ptr_eq(&self, other: &CopyEngine) -> bool {
        std::ptr::eq(self, other)
    }
}

/// An open copy context. Reservations and recorded copies accumulate here
/// until the set is submitted.
pub struct CopyPass<'a> {
    engine: &'a CopyEngine,
    ctx: MutexGuard<'a, CopyContext>,
}

impl CopyPass<'_> {
    /// Reserves `size` bytes at the given alignment.
    ///
    /// The reservation is writable immediately; it is consumed once this
    /// pass's submission fence is reached.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Result<UploadReservation> {
        assert!(alignment.is_power_of_two());

        let offset = loop {
            let ring = &mut self.ctx.ring;
            let aligned = ring.position.next_multiple_of(alignment);
            if !ring.wrapped && aligned + size <= ring.chunk.size {
                // Fits in place between the cursor and the buffer end.
                ring.position = aligned + size;
                break aligned;
            }
            if !ring.wrapped && size <= ring.last {
                // Wrap to offset 0; the run stays clear of unconsumed data
                // and never straddles the wrap point.
                ring.wrapped = true;
                ring.position = size;
                break 0;
            }
            if ring.wrapped && aligned + size <= ring.last {
                ring.position = aligned + size;
                break aligned;
            }
            self.grow(size)?;
        };

        let ring = &self.ctx.ring;
        Ok(UploadReservation {
            buffer: ring.chunk.id,
            offset,
            size,
            ptr: unsafe { ring.chunk.ptr.as_ptr().add(offset as usize) },
            _chunk: ring.chunk.clone(),
        })
    }

    /// Doubles the ring until `size` fits, retiring the old backing.
    fn grow(&mut self, size: u64) -> Result<()> {
        let ring = &mut self.ctx.ring;
        let mut new_size = ring.chunk.size * 2;
        while new_size < size {
            new_size *= 2;
        }
        if new_size > self.engine.desc.max_size {
            return Err(Error::StagingExhausted {
                requested: size,
                capacity: ring.chunk.size,
            });
        }
        tracing::info!(
            old_size = ring.chunk.size,
            new_size,
            "growing staging ring"
        );
        let old = std::mem::replace(&mut ring.chunk, StagingChunk::new(new_size));
        ring.outgrown.push(old);
        ring.position = 0;
        ring.last = 0;
        ring.wrapped = false;
        Ok(())
    }

    /// Records a buffer upload from a reservation into a placed resource.
    pub fn copy_buffer(
        &mut self,
        src: &UploadReservation,
        dst: ResourceHandle,
        dst_offset: vk::DeviceSize,
    ) {
        self.ctx.commands.push(CopyCommand::Buffer {
            src: src.buffer,
            src_offset: src.offset,
            dst,
            dst_offset,
            size: src.size,
        });
    }

    /// Records an image upload into one mip/layer of a placed resource.
    pub fn copy_image(
        &mut self,
        src: &UploadReservation,
        dst: ResourceHandle,
        mip_level: u32,
        array_layer: u32,
        extent: vk::Extent3D,
    ) {
        self.ctx.commands.push(CopyCommand::Image {
            src: src.buffer,
            src_offset: src.offset,
            dst,
            mip_level,
            array_layer,
            extent,
        });
    }
}

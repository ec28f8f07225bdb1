//! Per-batch composition of barriers, uploads, and fence-gated releases.
//!
//! Independent worker threads build independent [`Batch`]es in parallel;
//! shared allocator state is touched only inside short per-call critical
//! sections. Submitting a batch reserves the queue's next counter value,
//! closes its copy contexts under that fence, flushes the coalesced barrier
//! set, and tags every queued release with the same sync point — so reclaim
//! of memory, descriptors, and staging space all key off one fence.
//!
//! Once submitted, a batch runs to completion; there is no cancellation. The
//! closest analogue is that nothing the batch touched is reused until its
//! fence is satisfied.
//!
//! The returned [`Submission`] is what the rendering frontend executes:
//! issue the barrier groups first, then the copies, then its own work, and
//! report the fence via [`Timeline::signal`](crate::Timeline::signal) when
//! the device is done.

use ash::vk;
use parking_lot::Mutex;

use crate::{
    Device, HasDevice,
    descriptor::{DescriptorRange, DescriptorTable},
    error::Result,
    heap::HeapPool,
    resource::ResourceHandle,
    staging::{CopyCommand, CopyEngine, CopyPass, UploadReservation},
    sync::{QueueId, SyncPoint},
    tracking::{Access, BarrierBatch, StateTable},
};

/// Everything the frontend needs to execute one submitted batch, in issue
/// order: barriers, then copies.
#[derive(Debug)]
pub struct Submission {
    pub sync: SyncPoint,
    pub barriers: BarrierBatch,
    pub copies: Vec<CopyCommand>,
}

/// Builds and submits command batches against one queue, and owns the shared
/// resource state table.
pub struct Submitter {
    device: Device,
    queue: QueueId,
    states: Mutex<StateTable>,
}

impl HasDevice for Submitter {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Submitter {
    pub fn new(device: Device, queue: QueueId) -> Self {
        Self {
            device,
            queue,
            states: Mutex::new(StateTable::new()),
        }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Starts tracking a freshly acquired resource at its initial state.
    pub fn adopt(
        &self,
        resource: ResourceHandle,
        access: Access,
        layout: Option<vk::ImageLayout>,
    ) {
        self.states.lock().register(resource, access, layout);
    }

    /// The tracked state, for callers sequencing their own work.
    pub fn current_state(&self, resource: ResourceHandle) -> Option<crate::tracking::ResourceState> {
        self.states.lock().current(resource)
    }

    /// Opens a new batch for one worker thread.
    pub fn begin(&self) -> Batch<'_> {
        Batch {
            submitter: self,
            engine: None,
            passes: Vec::new(),
            heap_releases: Vec::new(),
            descriptor_releases: Vec::new(),
        }
    }
}

/// One command batch under construction.
///
/// Batches from different threads interleave freely; each holds only its own
/// copy passes and release lists, and reaches the shared state table through
/// short locks.
pub struct Batch<'a> {
    submitter: &'a Submitter,
    engine: Option<&'a CopyEngine>,
    passes: Vec<CopyPass<'a>>,
    heap_releases: Vec<(&'a HeapPool, ResourceHandle)>,
    descriptor_releases: Vec<(&'a DescriptorTable, DescriptorRange)>,
}

impl<'a> Batch<'a> {
    /// Requests a transition of `resource` for this batch, coalesced with any
    /// transition already pending for it.
    pub fn transition(
        &mut self,
        resource: ResourceHandle,
        after: Access,
        layout_after: Option<vk::ImageLayout>,
    ) {
        self.submitter
            .states
            .lock()
            .transition(resource, after, layout_after);
    }

    /// Records a buffer upload: transitions the destination for copy writes,
    /// then records the copy into `pass`.
    pub fn stage_buffer_upload(
        &mut self,
        pass: &mut CopyPass<'a>,
        src: &UploadReservation,
        dst: ResourceHandle,
        dst_offset: vk::DeviceSize,
    ) {
        self.transition(dst, Access::COPY_DST, None);
        pass.copy_buffer(src, dst, dst_offset);
    }

    /// Image flavor of [`stage_buffer_upload`](Self::stage_buffer_upload).
    pub fn stage_image_upload(
        &mut self,
        pass: &mut CopyPass<'a>,
        src: &UploadReservation,
        dst: ResourceHandle,
        mip_level: u32,
        array_layer: u32,
        extent: vk::Extent3D,
    ) {
        self.transition(
            dst,
            Access::COPY_DST,
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        );
        pass.copy_image(src, dst, mip_level, array_layer, extent);
    }

    /// Adds an open copy pass to this batch. All passes of one batch must
    /// come from the same engine; they close under the batch's fence at
    /// submit.
    pub fn add_pass(&mut self, engine: &'a CopyEngine, pass: CopyPass<'a>) {
        match self.engine {
            None => self.engine = Some(engine),
            Some(existing) => {
                assert!(existing.ptr_eq(engine), "batch spans two copy engines")
            }
        }
        self.passes.push(pass);
    }

    /// Queues a resource release; at submit it is tagged with the batch's
    /// sync point, keeping the blocks locked until the batch completes.
    pub fn release_resource(&mut self, pool: &'a HeapPool, resource: ResourceHandle) {
        self.heap_releases.push((pool, resource));
    }

    /// Queues a descriptor range release, locked until the batch completes.
    pub fn release_descriptors(&mut self, table: &'a DescriptorTable, range: DescriptorRange) {
        self.descriptor_releases.push((table, range));
    }

    /// Reserves the batch's fence value, closes its copy passes, flushes the
    /// coalesced barriers, and performs the queued releases under that fence.
    pub fn submit(self) -> Result<Submission> {
        let submitter = self.submitter;
        let device = &submitter.device;
        device.ensure_alive(None)?;

        let sync = device.queue(submitter.queue).ticket();

        let copies = match self.engine {
            Some(engine) => engine.submit_at(sync, self.passes),
            None => Vec::new(),
        };

        let mut states = submitter.states.lock();
        let barriers = states.flush();
        for (pool, resource) in &self.heap_releases {
            states.forget(*resource);
            pool.release(*resource, sync)?;
        }
        drop(states);

        let completed = device.queue(submitter.queue).completed_value();
        for (table, range) in self.descriptor_releases {
            table.release(range, sync.value, completed);
        }

        tracing::debug!(
            queue = ?sync.queue,
            value = sync.value,
            copies = copies.len(),
            "batch submitted"
        );
        Ok(Submission {
            sync,
            barriers,
            copies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::HeapPoolDesc,
        resource::{HeapUsage, ResourceDesc},
        staging::CopyEngineDesc,
        sync::QueueKind,
    };

    struct Fixture {
        device: Device,
        queue: QueueId,
        pool: HeapPool,
        table: DescriptorTable,
        engine: CopyEngine,
        submitter: Submitter,
    }

    fn fixture() -> Fixture {
        let mut builder = Device::builder();
        let queue = builder.add_queue(QueueKind::Graphics);
        let device = builder.build();
        Fixture {
            pool: HeapPool::new(
                device.clone(),
                queue,
                HeapPoolDesc {
                    block_size: 64 * 1024,
                    blocks_per_heap: 64,
                    heap_count: 1,
                    usage: HeapUsage::BUFFER,
                    frames_in_flight: 2,
                },
            ),
            table: DescriptorTable::new(64),
            engine: CopyEngine::new(device.clone(), queue, CopyEngineDesc::default()),
            submitter: Submitter::new(device.clone(), queue),
            device,
            queue,
        }
    }

    #[test]
    fn a_batch_ties_uploads_barriers_and_releases_to_one_fence() {
        let f = fixture();
        let desc = ResourceDesc::buffer(100 * 1024, vk::BufferUsageFlags::VERTEX_BUFFER)
            .with_label("mesh vertices");
        let res = f.pool.acquire(&desc, false).unwrap();
        f.submitter.adopt(res.handle, Access::NONE, None);
        let bind = f.table.alloc(4, 0).unwrap();

        let mut batch = f.submitter.begin();
        let mut pass = f.engine.open().unwrap();
        let mut reservation = pass.reserve(100 * 1024, 256).unwrap();
        reservation.write(&[0xAB; 16]);
        batch.stage_buffer_upload(&mut pass, &reservation, res.handle, 0);
        batch.transition(res.handle, Access::SHADER_READ, None);
        batch.add_pass(&f.engine, pass);

        let submission = batch.submit().unwrap();
        assert_eq!(submission.copies.len(), 1);
        // COPY_DST then SHADER_READ coalesced into one pending entry.
        assert_eq!(submission.barriers.buffer.len(), 1);
        assert_eq!(
            submission.barriers.buffer[0].access_after,
            Access::SHADER_READ
        );
        assert_eq!(submission.copies[0].dst(), res.handle);

        // Release in a later batch; blocks stay locked until the fence.
        let mut batch = f.submitter.begin();
        batch.release_resource(&f.pool, res.handle);
        batch.release_descriptors(&f.table, bind);
        let release_sync = batch.submit().unwrap().sync;

        assert!(f.pool.placements(res.handle).is_err());
        let stats = f.pool.stats();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.reusable_blocks, stats.total_blocks - 2);

        f.device.queue(f.queue).signal(release_sync.value);
        assert_eq!(f.pool.stats().reusable_blocks, f.pool.stats().total_blocks);
        // The descriptor span is reusable as well once the fence landed.
        let again = f.table.alloc(4, release_sync.value).unwrap();
        assert_eq!((again.first, again.count), (bind.first, bind.count));
    }

    #[test]
    fn empty_batches_still_advance_the_fence() {
        let f = fixture();
        let a = f.submitter.begin().submit().unwrap();
        let b = f.submitter.begin().submit().unwrap();
        assert_eq!(a.sync.queue, b.sync.queue);
        assert!(b.sync.value > a.sync.value);
        assert!(a.barriers.is_empty());
        assert!(a.copies.is_empty());
    }

    #[test]
    fn parallel_batches_interleave_safely() {
        let f = std::sync::Arc::new(fixture());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        let desc =
                            ResourceDesc::buffer(64 * 1024, vk::BufferUsageFlags::STORAGE_BUFFER);
                        let res = f.pool.acquire(&desc, false).unwrap();
                        f.submitter.adopt(res.handle, Access::NONE, None);
                        let mut batch = f.submitter.begin();
                        batch.transition(res.handle, Access::UNORDERED_ACCESS, None);
                        batch.release_resource(&f.pool, res.handle);
                        let submission = batch.submit().unwrap();
                        f.device.queue(submission.sync.queue).signal(submission.sync.value);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let stats = f.pool.stats();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, stats.total_blocks);
    }
}

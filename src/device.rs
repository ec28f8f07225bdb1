//! The device handle shared by every allocator in this crate.
//!
//! [`Device`] is the cheaply clonable root object: it owns the per-queue
//! submission [`Timeline`]s, the retire queue for fence-gated destruction, and
//! the device-removal latch. It performs no driver calls itself — the
//! rendering frontend creates the API objects described by the placements this
//! crate computes, and reports fence progress back through
//! [`Timeline::signal`].
//!
//! # Usage
//!
//! ```
//! use scoria::{Device, QueueKind};
//!
//! let mut builder = Device::builder();
//! let gfx = builder.add_queue(QueueKind::Graphics);
//! let transfer = builder.add_queue(QueueKind::Transfer);
//! let device = builder.build();
//!
//! assert_eq!(device.queues().count(), 2);
//! assert!(device.queue(gfx).is_idle());
//! # let _ = transfer;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    sync::{QueueId, QueueKind, RetiredResource, SignalHub, SyncPoint, Timeline},
};

/// A handle to the device state shared across allocators.
///
/// Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    queues: Arc<[Timeline]>,
    retire: crossbeam_channel::Sender<RetiredResource>,
    /// Removal reason, latched once. `None` while the device is healthy.
    lost: Mutex<Option<String>>,
}

/// Accessor trait for types owning or borrowing a [`Device`].
pub trait HasDevice {
    fn device(&self) -> &Device;
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl Device {
    /// Starts building a device. At least one queue must be added.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder { kinds: Vec::new() }
    }

    /// The timeline of one queue.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this device's builder.
    pub fn queue(&self, id: QueueId) -> &Timeline {
        &self.0.queues[id.index()]
    }

    /// All queue timelines, in creation order.
    pub fn queues(&self) -> impl Iterator<Item = &Timeline> {
        self.0.queues.iter()
    }

    /// Returns the first queue of the given kind, if any was created.
    pub fn queue_of_kind(&self, kind: QueueKind) -> Option<&Timeline> {
        self.queues().find(|q| q.kind() == kind)
    }

    /// `true` once the sync point's queue has completed past it.
    pub fn is_reached(&self, sync: SyncPoint) -> bool {
        self.queue(sync.queue).is_reached(sync.value)
    }

    /// Blocks until every queue has completed everything reserved so far.
    ///
    /// This is the last-resort stall used by the heap pool on exhaustion; it
    /// relies on the integration layer continuing to report completions.
    pub fn wait_idle(&self) {
        for queue in self.queues() {
            queue.wait(queue.pending_value());
        }
    }

    /// Parks `payload` on the retire queue; it is dropped once `sync` is
    /// reached. Used for old staging backings after a resize and any other
    /// resource whose destruction must trail the GPU.
    pub fn schedule_deferred_release<T: Send + 'static>(&self, sync: SyncPoint, payload: T) {
        // The recycler lives as long as the device, so the send cannot fail.
        self.0
            .retire
            .send(RetiredResource {
                sync,
                _payload: Box::new(payload),
            })
            .ok();
    }

    /// Latches a device-removal reason. All subsequent allocator calls fail
    /// with [`Error::DeviceLost`]. The first reported reason wins.
    pub fn report_lost(&self, reason: impl Into<String>) {
        let mut lost = self.0.lost.lock();
        if lost.is_none() {
            let reason = reason.into();
            tracing::error!(%reason, "device removed");
            *lost = Some(reason);
        }
    }

    /// The latched removal reason, if the device was lost.
    pub fn lost_reason(&self) -> Option<String> {
        self.0.lost.lock().clone()
    }

    /// Fails with [`Error::DeviceLost`] if a removal was reported, attaching
    /// the label of the resource being processed for diagnostics.
    pub(crate) fn ensure_alive(&self, label: Option<&str>) -> Result<()> {
        match &*self.0.lost.lock() {
            None => Ok(()),
            Some(reason) => Err(Error::DeviceLost {
                reason: reason.clone(),
                label: label.map(str::to_owned),
            }),
        }
    }
}

/// Builder collecting the device's queue set.
pub struct DeviceBuilder {
    kinds: Vec<QueueKind>,
}

impl DeviceBuilder {
    /// Adds a queue and returns its id.
    pub fn add_queue(&mut self, kind: QueueKind) -> QueueId {
        let id = QueueId(self.kinds.len() as u16);
        self.kinds.push(kind);
        id
    }

    /// Finalizes the device and spawns the deferred-release thread.
    ///
    /// # Panics
    ///
    /// Panics if no queue was added.
    pub fn build(self) -> Device {
        assert!(!self.kinds.is_empty(), "a device needs at least one queue");
        let hub = SignalHub::new();
        let queues: Arc<[Timeline]> = self
            .kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| Timeline::new(QueueId(i as u16), kind, hub.clone()))
            .collect();
        let (retire, receiver) = crossbeam_channel::unbounded();
        crate::sync::spawn_recycler_thread(queues.clone(), hub, receiver);
        Device(Arc::new(DeviceInner {
            queues,
            retire,
            lost: Mutex::new(None),
        }))
    }
}

impl Device {
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Device, QueueId) {
        let mut builder = Device::builder();
        let queue = builder.add_queue(QueueKind::Graphics);
        (builder.build(), queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_idle_returns_once_all_queues_catch_up() {
        let mut builder = Device::builder();
        let gfx = builder.add_queue(QueueKind::Graphics);
        let dma = builder.add_queue(QueueKind::Transfer);
        let device = builder.build();

        let a = device.queue(gfx).ticket();
        let b = device.queue(dma).ticket();
        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_idle())
        };
        device.queue(gfx).signal(a.value);
        device.queue(dma).signal(b.value);
        waiter.join().unwrap();
    }

    #[test]
    fn lost_device_fails_allocator_entry_points() {
        let (device, _) = Device::for_tests();
        assert!(device.ensure_alive(None).is_ok());
        device.report_lost("page fault in shader table");
        // First reason is sticky.
        device.report_lost("secondary report");
        match device.ensure_alive(Some("shadow atlas")) {
            Err(Error::DeviceLost { reason, label }) => {
                assert_eq!(reason, "page fault in shader table");
                assert_eq!(label.as_deref(), Some("shadow atlas"));
            }
            other => panic!("expected DeviceLost, got {other:?}"),
        }
    }
}

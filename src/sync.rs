//! Submission timelines and fence-gated deferred release.
//!
//! Everything in this crate that reuses memory, descriptors, or staging space
//! does so by comparing a tagged [`SyncPoint`] against the owning queue's
//! completed counter — never by convention at release time.
//!
//! # Key Types
//!
//! - [`SyncPoint`]: a monotonically increasing counter value paired with the
//!   queue it belongs to. "Reached" once the queue's completed counter is at
//!   least the sync point's value.
//! - [`Timeline`]: the per-queue counter pair. The pending counter hands out
//!   reserve-and-advance tickets at submission time; the completed counter is
//!   advanced by the integration layer as the device reports progress, and is
//!   cached in an [`AtomicU64`] so polling never takes a lock.
//!
//! # Usage
//!
//! ```
//! use scoria::{Device, QueueKind};
//!
//! let mut builder = Device::builder();
//! let gfx = builder.add_queue(QueueKind::Graphics);
//! let device = builder.build();
//!
//! // Submitting a batch reserves the next counter value.
//! let ticket = device.queue(gfx).ticket();
//! assert!(!device.queue(gfx).is_reached(ticket.value));
//!
//! // The integration layer reports completion; dependent reuse unblocks.
//! device.queue(gfx).signal(ticket.value);
//! assert!(device.queue(gfx).is_reached(ticket.value));
//! ```
//!
//! # Deferred Release
//!
//! Resources released while the device may still be reading them are parked on
//! a retire queue: (payload, sync point) pairs swept by a background recycler
//! thread once the sync point is reached. See
//! [`Device::schedule_deferred_release`](crate::Device::schedule_deferred_release).

use std::{
    any::Any,
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

/// Identifies one command queue on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub(crate) u16);

impl QueueId {
    /// Index of this queue in [`Device::queues`](crate::Device::queues) order.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The workload class a queue was created for.
///
/// Separate allocator instances are typically bound to separate queue kinds
/// (render targets on the graphics queue, staging on the transfer queue) so
/// that reuse gating never crosses queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// A point on a queue's submission timeline.
///
/// Obtained from [`Timeline::ticket`] when a batch is submitted. Reached once
/// the queue's completed counter is at least `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPoint {
    pub queue: QueueId,
    pub value: u64,
}

/// Notifies fence waiters across all queues of a device.
///
/// One hub is shared by every [`Timeline`] of a device so that waiters with
/// multiple candidate queues (the recycler thread, `wait_idle`) need a single
/// condvar.
pub(crate) struct SignalHub {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl SignalHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        })
    }

    fn notify(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    /// Blocks until `check` passes or the timeout elapses. `check` is
    /// re-evaluated under the hub lock to close the gap between a fast-path
    /// check and going to sleep.
    fn wait_until(&self, timeout: Option<Duration>, mut check: impl FnMut() -> bool) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if check() {
                return true;
            }
            match timeout {
                Some(t) => {
                    if self.condvar.wait_for(&mut guard, t).timed_out() {
                        return check();
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        }
    }
}

/// The monotonic counter pair for one command queue.
///
/// `pending` is the last reserved ticket value; `completed` is the last value
/// the device is known to have finished. Both only ever increase. The
/// completed counter is advanced via [`signal`](Self::signal) with a
/// `fetch_max`, so stale reports from out-of-order fence callbacks are
/// harmless.
pub struct Timeline {
    queue: QueueId,
    kind: QueueKind,
    pending: AtomicU64,
    completed: AtomicU64,
    hub: Arc<SignalHub>,
}

impl Timeline {
    pub(crate) fn new(queue: QueueId, kind: QueueKind, hub: Arc<SignalHub>) -> Self {
        Self {
            queue,
            kind,
            pending: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            hub,
        }
    }

    pub fn id(&self) -> QueueId {
        self.queue
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// The last value the device is known to have completed.
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// The last reserved ticket value. Everything at or below this is either
    /// executing or already complete.
    pub fn pending_value(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserves and advances the next counter value for a batch about to be
    /// submitted.
    pub fn ticket(&self) -> SyncPoint {
        let value = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        SyncPoint {
            queue: self.queue,
            value,
        }
    }

    /// Reports device progress: the queue has completed every batch up to and
    /// including `value`. Wakes all fence waiters.
    pub fn signal(&self, value: u64) {
        let prev = self.completed.fetch_max(value, Ordering::AcqRel);
        debug_assert!(
            value <= self.pending_value(),
            "signaled value {value} was never reserved (pending {})",
            self.pending_value()
        );
        if prev < value {
            self.hub.notify();
        }
    }

    /// Returns `true` once the completed counter has reached `value`.
    pub fn is_reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// `true` when nothing reserved on this queue is still outstanding.
    pub fn is_idle(&self) -> bool {
        self.completed_value() >= self.pending_value()
    }

    /// Blocks the calling thread until the completed counter reaches `value`.
    pub fn wait(&self, value: u64) {
        if self.is_reached(value) {
            return;
        }
        self.hub.wait_until(None, || self.is_reached(value));
    }
}

/// A resource parked until its sync point is reached.
///
/// The payload is type-erased; dropping it is the release. Anything `Send`
/// can ride the retire queue: heap placements, retired staging chunks,
/// descriptor ranges wrapped by their owner.
pub(crate) struct RetiredResource {
    pub sync: SyncPoint,
    /// Held only to be dropped once the sync point is reached.
    pub _payload: Box<dyn Any + Send>,
}

/// Spawns the background thread sweeping the retire queue.
///
/// # Algorithm
///
/// 1. **Receive phase**: drain pending retirements from the channel, grouping
///    them by queue and sync value. Already-elapsed items are dropped on the
///    spot.
/// 2. **Wait phase**: sleep on the device's signal hub until some queue
///    advances (bounded, so channel disconnection is noticed promptly).
/// 3. **Sweep phase**: drop every group whose sync point is now reached.
///
/// The thread exits once the channel disconnects, i.e. once the owning
/// [`Device`](crate::Device) is dropped; whatever remains parked is dropped
/// with it.
pub(crate) fn spawn_recycler_thread(
    queues: Arc<[Timeline]>,
    hub: Arc<SignalHub>,
    receiver: crossbeam_channel::Receiver<RetiredResource>,
) {
    std::thread::Builder::new()
        .name("scoria deferred release".to_string())
        .spawn(move || {
            let mut parked: BTreeMap<QueueId, BTreeMap<u64, Vec<RetiredResource>>> =
                BTreeMap::new();

            'outer: loop {
                'receive: loop {
                    let item = if parked.is_empty() {
                        match receiver.recv() {
                            Ok(item) => item,
                            Err(_) => break 'outer, // disconnected
                        }
                    } else {
                        match receiver.try_recv() {
                            Ok(item) => item,
                            Err(crossbeam_channel::TryRecvError::Empty) => break 'receive,
                            Err(crossbeam_channel::TryRecvError::Disconnected) => break 'outer,
                        }
                    };
                    let timeline = &queues[item.sync.queue.index()];
                    if timeline.is_reached(item.sync.value) {
                        drop(item);
                        continue;
                    }
                    parked
                        .entry(item.sync.queue)
                        .or_default()
                        .entry(item.sync.value)
                        .or_default()
                        .push(item);
                }

                hub.wait_until(Some(Duration::from_millis(50)), || {
                    parked.iter().any(|(queue, values)| {
                        values
                            .first_key_value()
                            .is_some_and(|(&v, _)| queues[queue.index()].is_reached(v))
                    })
                });

                let mut swept = 0usize;
                for (queue, values) in parked.iter_mut() {
                    let timeline = &queues[queue.index()];
                    while let Some((&value, _)) = values.first_key_value() {
                        if timeline.is_reached(value) {
                            let (_, items) = values.pop_first().unwrap();
                            swept += items.len();
                        } else {
                            break;
                        }
                    }
                }
                if swept > 0 {
                    tracing::trace!(swept, "deferred release sweep");
                }
                parked.retain(|_, values| !values.is_empty());
            }
            drop(receiver);
        })
        .expect("failed to spawn the deferred release thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn timeline() -> Timeline {
        Timeline::new(QueueId(0), QueueKind::Graphics, SignalHub::new())
    }

    #[test]
    fn tickets_advance_monotonically() {
        let t = timeline();
        assert_eq!(t.ticket().value, 1);
        assert_eq!(t.ticket().value, 2);
        assert_eq!(t.pending_value(), 2);
        assert_eq!(t.completed_value(), 0);
        assert!(!t.is_idle());
    }

    #[test]
    fn signal_is_monotonic() {
        let t = timeline();
        let a = t.ticket();
        let b = t.ticket();
        t.signal(b.value);
        // A stale report for an earlier value must not rewind the counter.
        t.signal(a.value);
        assert_eq!(t.completed_value(), b.value);
        assert!(t.is_idle());
    }

    #[test]
    fn wait_unblocks_on_signal() {
        let hub = SignalHub::new();
        let t = Arc::new(Timeline::new(QueueId(0), QueueKind::Transfer, hub));
        let ticket = t.ticket();
        let waiter = {
            let t = t.clone();
            std::thread::spawn(move || t.wait(ticket.value))
        };
        std::thread::sleep(Duration::from_millis(20));
        t.signal(ticket.value);
        waiter.join().unwrap();
        assert!(t.is_reached(ticket.value));
    }

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    #[test]
    fn recycler_drops_only_after_sync_point() {
        let hub = SignalHub::new();
        let queues: Arc<[Timeline]> = Arc::from(vec![Timeline::new(
            QueueId(0),
            QueueKind::Graphics,
            hub.clone(),
        )]);
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_recycler_thread(queues.clone(), hub, rx);

        let ticket = queues[0].ticket();
        let dropped = Arc::new(AtomicBool::new(false));
        tx.send(RetiredResource {
            sync: ticket,
            _payload: Box::new(DropFlag(dropped.clone())),
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert!(!dropped.load(Ordering::Acquire), "dropped before fence");

        queues[0].signal(ticket.value);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "sweep never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

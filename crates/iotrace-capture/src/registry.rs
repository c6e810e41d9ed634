use crate::error::CaptureError;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Identity of a device request queue. 0 never names a queue.
pub type QueueId = u64;

pub const MAX_TRACED_DEVICES: usize = 32;

/// Tells the producer path which devices are traced.
///
/// Queried on every intercepted I/O, so implementations must not block or allocate.
pub trait DeviceRegistry: Send + Sync {
    fn is_device_traced(&self, cpu: usize, queue: QueueId) -> bool;

    /// Forget every device. Called when the last client detaches.
    fn remove_all(&self);
}

/// Fixed table of traced queues.
///
/// Lookups are plain atomic loads. Updates are serialized by a writer lock so a queue never
/// lands in two slots.
#[derive(Debug)]
pub struct TracedDevices {
    slots: [AtomicU64; MAX_TRACED_DEVICES],
    writer: Mutex<()>,
}

impl Default for TracedDevices {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            writer: Mutex::new(()),
        }
    }
}

impl TracedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, queue: QueueId) -> Result<(), CaptureError> {
        if queue == 0 {
            return Err(CaptureError::invalid("queue id 0 is reserved"));
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.contains(queue) {
            return Err(CaptureError::invalid(format!("queue {queue} is already traced")));
        }

        let slot = self
            .slots
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == 0)
            .ok_or(CaptureError::NoSpace {
                len: MAX_TRACED_DEVICES + 1,
                max: MAX_TRACED_DEVICES,
            })?;
        slot.store(queue, Ordering::Release);

        debug!("Added queue {queue} to the trace list");
        Ok(())
    }

    /// Returns whether the queue was traced
    pub fn remove(&self, queue: QueueId) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match self
            .slots
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == queue && queue != 0)
        {
            Some(slot) => {
                slot.store(0, Ordering::Release);
                debug!("Removed queue {queue} from the trace list");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, queue: QueueId) -> bool {
        queue != 0
            && self
                .slots
                .iter()
                .any(|slot| slot.load(Ordering::Acquire) == queue)
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRegistry for TracedDevices {
    #[inline]
    fn is_device_traced(&self, _cpu: usize, queue: QueueId) -> bool {
        self.contains(queue)
    }

    fn remove_all(&self) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
        debug!("Removed all queues from the trace list");
    }
}

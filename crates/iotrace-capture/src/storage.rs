use crate::error::CaptureError;
use crate::ring::RingStorage;
use log::debug;
use std::sync::Arc;

/// Provides the backing memory of the per-CPU trace buffers.
///
/// Storage is requested once per CPU when a capture session starts and handed back when it
/// ends. Readers may keep their own reference to drain what is left after the session.
pub trait BufferStorage: Send + Sync {
    fn allocate(&self, cpu: usize, capacity: u64) -> Result<Arc<RingStorage>, CaptureError>;

    fn release(&self, cpu: usize, storage: Arc<RingStorage>) {
        debug!(
            "Released trace buffer for cpu {cpu} ({} bytes still buffered)",
            storage.used()
        );
    }
}

/// Heap-backed trace buffers
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStorage;

impl BufferStorage for HeapStorage {
    fn allocate(&self, cpu: usize, capacity: u64) -> Result<Arc<RingStorage>, CaptureError> {
        let storage = RingStorage::try_new(cpu, capacity)?;
        debug!("Allocated {capacity} bytes of trace buffer for cpu {cpu}");
        Ok(Arc::new(storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_storage_allocates_requested_capacity() {
        let storage = HeapStorage.allocate(3, 4096).unwrap();
        assert_eq!(storage.cpu(), 3);
        assert_eq!(storage.capacity(), 4096);
        assert_eq!(storage.used(), 0);
        assert!(!storage.is_producer_open());
    }

    #[test]
    fn test_heap_storage_reports_out_of_memory() {
        let err = HeapStorage.allocate(1, u64::MAX).unwrap_err();
        assert_eq!(
            err,
            CaptureError::OutOfMemory {
                cpu: 1,
                bytes: u64::MAX
            }
        );
    }
}

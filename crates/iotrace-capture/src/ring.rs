//! Per-CPU single-producer/single-consumer byte rings.
//!
//! A [`RingStorage`] is the backing region for one CPU. The capture core writes into it
//! through a [`RingBufferHandle`] opened in producer mode, and exactly one [`RingConsumer`]
//! drains it. Cursors are free-running byte counters: `head - tail` is the number of bytes
//! waiting, and positions are reduced modulo the capacity only when touching the region.

use crate::error::CaptureError;
use iotrace_shared::event::{DecodeError, Event, EventHeader, HEADER_SIZE};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct RingStorage {
    cpu: usize,
    data: NonNull<u8>,
    capacity: usize,
    /// Total bytes published by the producer
    head: AtomicU64,
    /// Total bytes consumed by the reader
    tail: AtomicU64,
    producer_open: AtomicBool,
    producer_busy: AtomicBool,
    reader_taken: AtomicBool,
    waiters: AtomicUsize,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

// SAFETY: the region is only written by the holder of `producer_busy`, in the free part
// `[head, tail + capacity)`, and only read by the single reader in `[tail, head)`. Both
// cursors are published with release and observed with acquire ordering.
unsafe impl Send for RingStorage {}
unsafe impl Sync for RingStorage {}

impl RingStorage {
    /// Allocate a zeroed region of `capacity` bytes for `cpu`
    pub fn try_new(cpu: usize, capacity: u64) -> Result<Self, CaptureError> {
        let oom = || CaptureError::OutOfMemory {
            cpu,
            bytes: capacity,
        };

        if capacity == 0 {
            return Err(CaptureError::invalid("trace buffer capacity must be nonzero"));
        }
        let capacity_bytes = usize::try_from(capacity).map_err(|_| oom())?;

        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(capacity_bytes).map_err(|_| oom())?;
        buf.resize(capacity_bytes, 0);
        let raw = Box::into_raw(buf.into_boxed_slice()) as *mut u8;

        Ok(Self {
            cpu,
            // SAFETY: Box::into_raw never returns null
            data: unsafe { NonNull::new_unchecked(raw) },
            capacity: capacity_bytes,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            producer_open: AtomicBool::new(false),
            producer_busy: AtomicBool::new(false),
            reader_taken: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written but not consumed yet
    pub fn used(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_producer_open(&self) -> bool {
        self.producer_open.load(Ordering::Acquire)
    }

    /// Take the reader side. A ring has at most one reader at a time.
    pub fn consumer(self: &Arc<Self>) -> Result<RingConsumer, CaptureError> {
        self.reader_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::Busy)?;

        Ok(RingConsumer {
            storage: self.clone(),
        })
    }

    fn copy_in(&self, pos: u64, src: &[u8]) {
        let offset = (pos % self.capacity as u64) as usize;
        let first = src.len().min(self.capacity - offset);

        // SAFETY: both ranges are inside the region and the caller owns them (see impl Sync)
        unsafe {
            let base = self.data.as_ptr();
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        let offset = (pos % self.capacity as u64) as usize;
        let first = dst.len().min(self.capacity - offset);

        // SAFETY: both ranges are inside the region and the caller owns them (see impl Sync)
        unsafe {
            let base = self.data.as_ptr();
            ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    /// Wake readers blocked in [`RingConsumer::wait_for_data`].
    ///
    /// Free when nobody waits. Otherwise the wait lock is held only long enough to signal.
    fn wake_readers(&self) {
        // Pairs with the SeqCst increment of `waiters` in wait_for_data: either the reader
        // sees the new head, or we see the reader.
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = self.wait_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wait_cv.notify_all();
    }
}

impl Drop for RingStorage {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.capacity);
        // SAFETY: allocated as a boxed slice of exactly this length in try_new
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl std::fmt::Debug for RingStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStorage")
            .field("cpu", &self.cpu)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("producer_open", &self.is_producer_open())
            .finish()
    }
}

/// Producer-mode view of a [`RingStorage`]. Closing (or dropping) it ends producer mode.
#[derive(Debug)]
pub struct RingBufferHandle {
    storage: Arc<RingStorage>,
    closed: AtomicBool,
}

impl RingBufferHandle {
    pub fn open(storage: Arc<RingStorage>) -> Result<Self, CaptureError> {
        storage
            .producer_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                CaptureError::invalid(format!(
                    "trace buffer for cpu {} is already open in producer mode",
                    storage.cpu
                ))
            })?;

        Ok(Self {
            storage,
            closed: AtomicBool::new(false),
        })
    }

    pub fn cpu(&self) -> usize {
        self.storage.cpu
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity
    }

    pub fn used(&self) -> usize {
        self.storage.used()
    }

    pub fn storage(&self) -> &Arc<RingStorage> {
        &self.storage
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim exclusive producer access to this ring for the lifetime of the guard, spinning
    /// while another producer holds it.
    ///
    /// This is the equivalent of disabling preemption on the CPU owning the ring. Only for
    /// rare control-plane pushes: the per-I/O path uses [`RingBufferHandle::try_pin`].
    #[inline]
    pub fn pin(&self) -> PinnedProducer<'_> {
        while !self.acquire() {
            std::hint::spin_loop();
        }

        PinnedProducer { handle: self }
    }

    /// Claim exclusive producer access without waiting.
    ///
    /// Returns `None` when another producer is inside the ring or the handle is closed. In the
    /// worker-per-core model the ring is never contended, so `None` means two submitters
    /// raced on one CPU and the caller should count the event as dropped.
    #[inline]
    pub fn try_pin(&self) -> Option<PinnedProducer<'_>> {
        if self.is_closed() || !self.acquire() {
            return None;
        }

        Some(PinnedProducer { handle: self })
    }

    #[inline]
    fn acquire(&self) -> bool {
        self.storage
            .producer_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn notify_readers(&self) {
        self.storage.wake_readers();
    }

    /// Leave producer mode, even while other references to this handle are alive.
    ///
    /// Waits for a push in flight to finish. Every later push fails with
    /// [`CaptureError::Closed`], and readers see the producer gone. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Anyone pinning after this sees `closed`
        drop(self.pin());

        self.storage.producer_open.store(false, Ordering::Release);
        self.storage.wake_readers();
    }

    pub fn close(self) {}
}

impl Drop for RingBufferHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Exclusive producer access to one ring, see [`RingBufferHandle::pin`]
pub struct PinnedProducer<'a> {
    handle: &'a RingBufferHandle,
}

impl PinnedProducer<'_> {
    pub fn free(&self) -> usize {
        let storage = &self.handle.storage;
        storage.capacity - storage.used()
    }

    /// Copy one record into the ring. Nothing is written when it does not fit or when the
    /// handle was shut down.
    #[inline]
    pub fn push(&mut self, record: &[u8]) -> Result<(), CaptureError> {
        let storage = &self.handle.storage;
        if self.handle.is_closed() {
            return Err(CaptureError::Closed { cpu: storage.cpu });
        }

        // Only the pinned producer moves head
        let head = storage.head.load(Ordering::Relaxed);
        let tail = storage.tail.load(Ordering::Acquire);
        let free = storage.capacity - (head - tail) as usize;

        if record.len() > free {
            return Err(CaptureError::BufferFull {
                needed: record.len(),
                free,
            });
        }

        storage.copy_in(head, record);
        storage
            .head
            .store(head + record.len() as u64, Ordering::Release);
        Ok(())
    }
}

impl Drop for PinnedProducer<'_> {
    fn drop(&mut self) {
        self.handle.storage.producer_busy.store(false, Ordering::Release);
    }
}

/// Reader side of a ring. Records are returned whole, in push order.
#[derive(Debug)]
pub struct RingConsumer {
    storage: Arc<RingStorage>,
}

impl RingConsumer {
    pub fn cpu(&self) -> usize {
        self.storage.cpu
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity
    }

    pub fn used(&self) -> usize {
        self.storage.used()
    }

    pub fn is_producer_open(&self) -> bool {
        self.storage.is_producer_open()
    }

    fn has_record(&self) -> bool {
        self.storage.used() >= HEADER_SIZE
    }

    /// Pop the next raw record, `None` when the ring is empty.
    ///
    /// A record whose declared size cannot be right means the region is corrupted: everything
    /// currently buffered is discarded and the error returned.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let storage = &self.storage;
        let tail = storage.tail.load(Ordering::Relaxed);
        let head = storage.head.load(Ordering::Acquire);
        let available = (head - tail) as usize;
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        storage.copy_out(tail, &mut header);
        let len = EventHeader::record_len(&header);
        if len < HEADER_SIZE || len > available {
            storage.tail.store(head, Ordering::Release);
            return Err(DecodeError::Truncated {
                needed: len.max(HEADER_SIZE),
                available,
            });
        }

        let mut record = vec![0u8; len];
        storage.copy_out(tail, &mut record);
        storage.tail.store(tail + len as u64, Ordering::Release);

        Ok(Some(record))
    }

    /// Pop and decode the next event
    pub fn read_event(&mut self) -> Result<Option<Event>, DecodeError> {
        match self.read_record()? {
            Some(record) => Event::decode(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Block until a record is available, the producer closes, or `timeout` elapses.
    ///
    /// Returns whether a record is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        if self.has_record() {
            return true;
        }

        let storage = &self.storage;
        let deadline = Instant::now() + timeout;
        let mut guard = storage
            .wait_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        storage.waiters.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        while !self.has_record() && storage.is_producer_open() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = storage
                .wait_cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        storage.waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        self.has_record()
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.storage.reader_taken.store(false, Ordering::Release);
    }
}

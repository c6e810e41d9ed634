//! The per-I/O hot path.
//!
//! Everything here runs synchronously inside an I/O submission: no allocation, no blocking,
//! and a full buffer only costs the event.

use crate::cpu;
use crate::error::CaptureError;
use crate::hook::{Direction, IoCallback, IoDescriptor};
use crate::registry::{DeviceRegistry, QueueId};
use crate::ring::{RingBufferHandle, RingStorage};
use crate::sequence::SequenceGenerator;
use crate::stats::CaptureStats;
use iotrace_shared::event::SECTOR_SHIFT;
use iotrace_shared::{DeviceDescriptor, DeviceName, Event, IoEvent, IoFlags, Operation};
use log::warn;
use std::sync::Arc;

/// Turn a submission into the fields of an I/O event
pub fn classify(io: &IoDescriptor) -> IoEvent {
    let operation = if io.discard {
        Operation::Discard
    } else if io.direction == Direction::Write {
        Operation::Write
    } else {
        Operation::Read
    };

    let mut flags = IoFlags::empty();
    if io.flush {
        flags |= IoFlags::FLUSH;
    }
    if io.fua {
        flags |= IoFlags::FUA;
    }

    IoEvent {
        operation,
        flags,
        lba: io.sector,
        len: io.size_bytes >> SECTOR_SHIFT,
        io_class: io.io_class,
        device_id: io.device_id,
    }
}

/// Producer side of one capture session: one open buffer per CPU
pub struct ProducerPath {
    buffers: Vec<RingBufferHandle>,
    sequence: Arc<SequenceGenerator>,
    registry: Arc<dyn DeviceRegistry>,
    stats: Arc<CaptureStats>,
}

impl ProducerPath {
    pub(crate) fn new(
        buffers: Vec<RingBufferHandle>,
        sequence: Arc<SequenceGenerator>,
        registry: Arc<dyn DeviceRegistry>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            buffers,
            sequence,
            registry,
            stats,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn storages(&self) -> impl Iterator<Item = &Arc<RingStorage>> {
        self.buffers.iter().map(RingBufferHandle::storage)
    }

    /// Record one traced I/O. A full ring or a second submitter already inside the ring on
    /// this CPU both cost the event, counted as a drop, and never stall the submission.
    fn trace_io(&self, cpu: usize, buffer: &RingBufferHandle, io: &IoDescriptor) {
        let Some(mut producer) = buffer.try_pin() else {
            self.stats.record_drop(cpu);
            return;
        };
        // Taken while pinned so ids increase along each buffer
        let sequence_id = self.sequence.next();
        let event = Event::io(sequence_id, cpu::monotonic_ns(), classify(io));

        match producer.push(event.encode().as_bytes()) {
            Ok(()) => self.stats.record_push(cpu),
            Err(_) => self.stats.record_drop(cpu),
        }
        drop(producer);

        buffer.notify_readers();
    }

    /// Push a device descriptor to `cpu`'s buffer. Unlike I/O events, a full buffer is
    /// reported to the caller.
    pub(crate) fn emit_descriptor(
        &self,
        cpu: usize,
        device_id: u32,
        device_name: DeviceName,
        device_size: u64,
    ) -> Result<(), CaptureError> {
        let buffer = self.buffers.get(cpu).ok_or_else(|| {
            CaptureError::invalid(format!(
                "cpu {cpu} has no trace buffer ({} cpus)",
                self.buffers.len()
            ))
        })?;

        let mut producer = buffer.pin();
        let event = Event::device_descriptor(
            self.sequence.next(),
            cpu::monotonic_ns(),
            DeviceDescriptor {
                device_id,
                device_name,
                device_size,
            },
        );
        let result = producer.push(event.encode().as_bytes());
        drop(producer);

        match &result {
            Ok(()) => self.stats.record_push(cpu),
            Err(err) => {
                self.stats.record_drop(cpu);
                warn!("Failed to push descriptor of device {device_name} to cpu {cpu}: {err}");
            }
        }
        buffer.notify_readers();

        result
    }

    /// Close every buffer and hand back their storage.
    ///
    /// Works through a shared reference: whoever still holds this path afterwards can only
    /// see its pushes refused.
    pub(crate) fn shutdown(&self) -> Vec<Arc<RingStorage>> {
        self.buffers
            .iter()
            .map(|buffer| {
                buffer.shutdown();
                buffer.storage().clone()
            })
            .collect()
    }
}

impl IoCallback for ProducerPath {
    #[inline]
    fn on_io(&self, cpu: usize, queue: QueueId, io: &IoDescriptor) {
        if !self.registry.is_device_traced(cpu, queue) {
            return;
        }

        match self.buffers.get(cpu) {
            Some(buffer) => self.trace_io(cpu, buffer, io),
            None => self.stats.record_drop(cpu),
        }
    }
}

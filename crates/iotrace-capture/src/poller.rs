use crate::prelude::*;
use crate::ring::RingConsumer;
use iotrace_shared::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

/// A handler function for processing events, called with the CPU of the buffer they came from
pub type EventHandler<T> = Box<dyn Fn(T) + Send>;

/// What a poller saw over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub events: u64,
    pub decode_errors: u64,
}

/// TracePoller drains per-CPU trace buffers in a background thread
/// and sends events to a handler
pub struct TracePoller {
    shutdown: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<PollSummary>>,
}

impl TracePoller {
    /// Create a new TracePoller over the given consumers
    ///
    /// # Arguments
    /// * `consumers` - Reader sides of the buffers to drain
    /// * `handler` - Callback function to handle each `(cpu, event)`
    /// * `poll_timeout_ms` - How long to wait for events in each poll iteration
    pub fn new(
        consumers: Vec<RingConsumer>,
        handler: EventHandler<(usize, Event)>,
        poll_timeout_ms: u64,
    ) -> Result<Self> {
        if consumers.is_empty() {
            bail!("No trace buffer to poll");
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        // Split the timeout so a quiet buffer doesn't delay the others
        let wait = Duration::from_millis(poll_timeout_ms.max(1)) / consumers.len() as u32;
        let wait = wait.max(Duration::from_millis(1));

        let poll_thread = std::thread::Builder::new()
            .name("iotrace-poller".into())
            .spawn(move || {
                let mut consumers = consumers;
                let mut summary = PollSummary::default();

                while !shutdown_clone.load(Ordering::Relaxed) {
                    let drained = drain(&mut consumers, &handler, &mut summary);
                    if drained == 0 {
                        for consumer in &consumers {
                            if consumer.wait_for_data(wait) {
                                break;
                            }
                        }
                    }
                }

                // Events pushed before shutdown are still delivered
                drain(&mut consumers, &handler, &mut summary);
                summary
            })
            .context("Failed to spawn the trace poller thread")?;

        Ok(Self {
            shutdown,
            poll_thread: Some(poll_thread),
        })
    }

    /// Create a new TracePoller with an mpsc channel for events
    ///
    /// Returns the TracePoller and the receiver end of the channel
    pub fn with_channel(
        consumers: Vec<RingConsumer>,
        poll_timeout_ms: u64,
    ) -> Result<(Self, mpsc::Receiver<(usize, Event)>)> {
        let (tx, rx) = mpsc::channel();
        let poller = Self::new(
            consumers,
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
            poll_timeout_ms,
        )?;
        Ok((poller, rx))
    }

    /// Stop the polling thread and wait for it to finish
    pub fn shutdown(&mut self) -> Option<PollSummary> {
        self.shutdown.store(true, Ordering::Relaxed);
        let thread = self.poll_thread.take()?;
        match thread.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                error!("Trace poller thread panicked");
                None
            }
        }
    }
}

impl Drop for TracePoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(
    consumers: &mut [RingConsumer],
    handler: &EventHandler<(usize, Event)>,
    summary: &mut PollSummary,
) -> usize {
    let mut drained = 0;
    for consumer in consumers.iter_mut() {
        loop {
            match consumer.read_event() {
                Ok(Some(event)) => {
                    drained += 1;
                    summary.events += 1;
                    handler((consumer.cpu(), event));
                }
                Ok(None) => break,
                Err(err) => {
                    summary.decode_errors += 1;
                    warn!("Dropping undecodable record from cpu {}: {err}", consumer.cpu());
                }
            }
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{RingBufferHandle, RingStorage};
    use iotrace_shared::{IoEvent, IoFlags, Operation};

    fn open(cpu: usize) -> (RingBufferHandle, RingConsumer) {
        let storage = Arc::new(RingStorage::try_new(cpu, 4096).unwrap());
        let handle = RingBufferHandle::open(storage.clone()).unwrap();
        let consumer = storage.consumer().unwrap();
        (handle, consumer)
    }

    fn push(handle: &RingBufferHandle, sequence_id: u64) {
        let event = Event::io(
            sequence_id,
            0,
            IoEvent {
                operation: Operation::Write,
                flags: IoFlags::empty(),
                lba: sequence_id,
                len: 8,
                io_class: 0,
                device_id: 1,
            },
        );
        handle.pin().push(event.encode().as_bytes()).unwrap();
        handle.notify_readers();
    }

    #[test_log::test]
    fn test_poller_delivers_every_buffer() {
        let (first, first_consumer) = open(0);
        let (second, second_consumer) = open(1);
        let (mut poller, rx) =
            TracePoller::with_channel(vec![first_consumer, second_consumer], 10).unwrap();

        push(&first, 1);
        push(&second, 2);
        push(&first, 3);

        let mut received: Vec<(usize, u64)> = (0..3)
            .map(|_| {
                let (cpu, event) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                (cpu, event.sequence_id())
            })
            .collect();
        received.sort();
        assert_eq!(received, vec![(0, 1), (0, 3), (1, 2)]);

        let summary = poller.shutdown().unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.decode_errors, 0);
    }

    #[test_log::test]
    fn test_shutdown_drains_pending_events() {
        let (handle, consumer) = open(0);
        let (mut poller, rx) = TracePoller::with_channel(vec![consumer], 1000).unwrap();
        for sequence_id in 1..=5 {
            push(&handle, sequence_id);
        }
        poller.shutdown();

        let ids: Vec<u64> = rx.iter().map(|(_, event)| event.sequence_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_no_consumer_is_rejected() {
        assert!(TracePoller::with_channel(Vec::new(), 10).is_err());
    }
}

//! Capture control plane.
//!
//! [`CaptureContext`] owns the per-CPU buffers and turns capture on for the first attached
//! client and off for the last one. Every transition runs under a single mutex. The producer
//! path never takes it: it reaches its buffers through the [`ProducerPath`] installed in the
//! interception source, which stays untouched for the whole session.

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::hook::InterceptionSource;
use crate::producer::ProducerPath;
use crate::registry::DeviceRegistry;
use crate::ring::{RingBufferHandle, RingConsumer};
use crate::sequence::SequenceGenerator;
use crate::sizing;
use crate::stats::{CaptureStats, StatsSnapshot};
use crate::storage::BufferStorage;
use iotrace_shared::{DeviceName, VersionInfo};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing { clients: u32 },
}

/// Control-plane state observed atomically, for invariant checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub clients: u32,
    pub open_buffers: usize,
    pub callback_registered: bool,
}

struct Session {
    producer: Arc<ProducerPath>,
    started: StatsSnapshot,
}

struct ControlState {
    clients: u32,
    /// Per-CPU capacity in bytes
    capacity: u64,
    session: Option<Session>,
}

pub struct CaptureContext {
    cpus: usize,
    max_buffer_size_mb: u64,
    version: VersionInfo,
    sequence: Arc<SequenceGenerator>,
    stats: Arc<CaptureStats>,
    hook: Arc<dyn InterceptionSource>,
    registry: Arc<dyn DeviceRegistry>,
    storage: Arc<dyn BufferStorage>,
    control: Mutex<ControlState>,
}

impl CaptureContext {
    /// Create an idle context. The configured buffer size is validated right away.
    pub fn new(
        config: &CaptureConfig,
        hook: Arc<dyn InterceptionSource>,
        registry: Arc<dyn DeviceRegistry>,
        storage: Arc<dyn BufferStorage>,
    ) -> Result<Self, CaptureError> {
        let cpus = config.cpu_count();
        let capacity =
            sizing::per_cpu_capacity(config.buffer_size_mb, cpus, config.max_buffer_size_mb)?;
        let version = VersionInfo::current();

        info!(
            "Trace context ready: {cpus} cpu(s), {} MiB of trace buffer ({capacity} bytes per cpu)",
            config.buffer_size_mb
        );
        debug!("Event format: {:?}", version.as_str());

        Ok(Self {
            cpus,
            max_buffer_size_mb: config.max_buffer_size_mb,
            version,
            sequence: Arc::new(SequenceGenerator::new()),
            stats: Arc::new(CaptureStats::new(cpus)),
            hook,
            registry,
            storage,
            control: Mutex::new(ControlState {
                clients: 0,
                capacity,
                session: None,
            }),
        })
    }

    fn lock_control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start capturing for a new client.
    ///
    /// The first client allocates and opens every per-CPU buffer and installs the producer
    /// path. Any failure on the way is fully unwound and the context stays idle.
    pub fn attach(&self) -> Result<(), CaptureError> {
        let mut control = self.lock_control();

        if control.clients == 0 {
            let producer = Arc::new(self.open_buffers(control.capacity)?);

            if let Err(err) = self.hook.register(producer.clone()) {
                error!("Failed to register tracing callback: {err}");
                self.close_buffers(producer);
                return Err(match err {
                    CaptureError::RegistrationFailure(_) => err,
                    other => CaptureError::RegistrationFailure(other.to_string()),
                });
            }
            info!("Registered tracing callback");

            control.session = Some(Session {
                producer,
                started: self.stats.snapshot(),
            });
        }

        control.clients += 1;
        debug!("Client attached, {} client(s)", control.clients);
        Ok(())
    }

    /// Drop a client. The last one stops capture and releases every buffer before returning.
    pub fn detach(&self) {
        let mut control = self.lock_control();

        if control.clients == 0 {
            warn!("Ignoring detach: no client is attached");
            return;
        }

        control.clients -= 1;
        if control.clients > 0 {
            debug!("Client detached, {} client(s) left", control.clients);
            return;
        }

        // No producer may run once buffers close, so the callback goes first
        self.hook.unregister();
        self.registry.remove_all();

        if let Some(session) = control.session.take() {
            let summary = self.stats.snapshot().since(&session.started);
            self.close_buffers(session.producer);
            info!(
                "Unregistered tracing callback ({} event(s) captured, {} dropped)",
                summary.total_pushed(),
                summary.total_dropped()
            );
        }
    }

    fn open_buffers(&self, capacity: u64) -> Result<ProducerPath, CaptureError> {
        let mut buffers = Vec::with_capacity(self.cpus);

        for cpu in 0..self.cpus {
            let storage = match self.storage.allocate(cpu, capacity) {
                Ok(storage) => storage,
                Err(err) => {
                    error!("Failed to allocate trace buffer for cpu {cpu}: {err}");
                    self.release_buffers(buffers);
                    return Err(err);
                }
            };

            match RingBufferHandle::open(storage.clone()) {
                Ok(handle) => buffers.push(handle),
                Err(err) => {
                    error!("Failed to open trace buffer for cpu {cpu}: {err}");
                    self.storage.release(cpu, storage);
                    self.release_buffers(buffers);
                    return Err(err);
                }
            }
        }

        Ok(ProducerPath::new(
            buffers,
            self.sequence.clone(),
            self.registry.clone(),
            self.stats.clone(),
        ))
    }

    fn release_buffers(&self, buffers: Vec<RingBufferHandle>) {
        for buffer in buffers {
            let cpu = buffer.cpu();
            let storage = buffer.storage().clone();
            buffer.close();
            self.storage.release(cpu, storage);
        }
    }

    /// Close every buffer of a session and release its storage, whether or not the producer
    /// path is still referenced elsewhere
    fn close_buffers(&self, producer: Arc<ProducerPath>) {
        if Arc::strong_count(&producer) > 1 {
            warn!("Tracing callback is still referenced, closing its buffers anyway");
        }

        for (cpu, storage) in producer.shutdown().into_iter().enumerate() {
            self.storage.release(cpu, storage);
        }
    }

    /// Set the total trace buffer size used by the next capture session
    pub fn configure_buffer_size(&self, total_mb: u64) -> Result<(), CaptureError> {
        let mut control = self.lock_control();

        if control.clients > 0 {
            return Err(CaptureError::AlreadyConfigured {
                clients: control.clients,
            });
        }

        let capacity = sizing::per_cpu_capacity(total_mb, self.cpus, self.max_buffer_size_mb)?;
        control.capacity = capacity;
        info!("Trace buffer size set to {total_mb} MiB ({capacity} bytes per cpu)");

        Ok(())
    }

    /// Total trace buffer size for all CPUs, in MiB
    pub fn get_total_buffer_size_mb(&self) -> u64 {
        sizing::total_size_mb(self.lock_control().capacity, self.cpus)
    }

    /// Announce a traced device on `cpu`'s buffer.
    ///
    /// The name is validated before anything is pushed. A full buffer is returned as
    /// [`CaptureError::BufferFull`].
    pub fn emit_device_descriptor(
        &self,
        cpu: usize,
        device_id: u32,
        device_name: &str,
        device_size: u64,
    ) -> Result<(), CaptureError> {
        let device_name = DeviceName::new(device_name)?;

        // Held across the push so teardown never closes a buffer under us
        let control = self.lock_control();
        let session = control.session.as_ref().ok_or(CaptureError::NotCapturing)?;
        session
            .producer
            .emit_descriptor(cpu, device_id, device_name, device_size)
    }

    /// Reader side of `cpu`'s buffer for the current session
    pub fn consumer(&self, cpu: usize) -> Result<RingConsumer, CaptureError> {
        let control = self.lock_control();
        let session = control.session.as_ref().ok_or(CaptureError::NotCapturing)?;
        let storage = session.producer.storages().nth(cpu).ok_or_else(|| {
            CaptureError::invalid(format!("cpu {cpu} has no trace buffer ({} cpus)", self.cpus))
        })?;
        storage.consumer()
    }

    /// Reader sides of every buffer, indexed by CPU
    pub fn consumers(&self) -> Result<Vec<RingConsumer>, CaptureError> {
        (0..self.cpus).map(|cpu| self.consumer(cpu)).collect()
    }

    pub fn state(&self) -> CaptureState {
        match self.lock_control().clients {
            0 => CaptureState::Idle,
            clients => CaptureState::Capturing { clients },
        }
    }

    pub fn client_count(&self) -> u32 {
        self.lock_control().clients
    }

    pub fn control_snapshot(&self) -> ControlSnapshot {
        let control = self.lock_control();
        let open_buffers = control
            .session
            .as_ref()
            .map(|session| {
                session
                    .producer
                    .storages()
                    .filter(|storage| storage.is_producer_open())
                    .count()
            })
            .unwrap_or(0);

        ControlSnapshot {
            clients: control.clients,
            open_buffers,
            callback_registered: control.session.is_some(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus
    }

    /// Per-CPU capacity in bytes
    pub fn per_cpu_capacity(&self) -> u64 {
        self.lock_control().capacity
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Last sequence id handed out
    pub fn last_sequence_id(&self) -> u64 {
        self.sequence.last()
    }
}

impl Drop for CaptureContext {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(session) = control.session.take() {
            warn!(
                "Capture context dropped with {} client(s) attached, stopping capture",
                control.clients
            );
            control.clients = 0;
            self.hook.unregister();
            self.registry.remove_all();
            let producer = session.producer;
            self.close_buffers(producer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::IoHook;
    use crate::registry::TracedDevices;
    use crate::storage::HeapStorage;

    fn context(buffer_size_mb: u64, cpus: usize) -> (CaptureContext, Arc<IoHook>) {
        let hook = Arc::new(IoHook::new());
        let config = CaptureConfig {
            buffer_size_mb,
            cpus: Some(cpus),
            ..Default::default()
        };
        let context = CaptureContext::new(
            &config,
            hook.clone(),
            Arc::new(TracedDevices::new()),
            Arc::new(HeapStorage),
        )
        .unwrap();
        (context, hook)
    }

    #[test_log::test]
    fn test_refcounted_session() {
        let (context, hook) = context(4, 2);
        assert_eq!(context.state(), CaptureState::Idle);

        context.attach().unwrap();
        context.attach().unwrap();
        assert_eq!(context.state(), CaptureState::Capturing { clients: 2 });
        assert_eq!(hook.registrations(), 1);

        context.detach();
        assert!(hook.is_registered());
        assert_eq!(context.control_snapshot().open_buffers, 2);

        context.detach();
        assert_eq!(context.state(), CaptureState::Idle);
        assert!(!hook.is_registered());
        assert_eq!(hook.unregistrations(), 1);
        assert_eq!(
            context.control_snapshot(),
            ControlSnapshot {
                clients: 0,
                open_buffers: 0,
                callback_registered: false,
            }
        );
    }

    #[test_log::test]
    fn test_unbalanced_detach_is_ignored() {
        let (context, hook) = context(4, 2);
        context.detach();
        assert_eq!(context.client_count(), 0);
        assert_eq!(hook.unregistrations(), 0);
    }

    #[test_log::test]
    fn test_invalid_initial_size() {
        let config = CaptureConfig {
            buffer_size_mb: 0,
            cpus: Some(2),
            ..Default::default()
        };
        let result = CaptureContext::new(
            &config,
            Arc::new(IoHook::new()),
            Arc::new(TracedDevices::new()),
            Arc::new(HeapStorage),
        );
        assert!(matches!(result, Err(CaptureError::InvalidArgument(_))));
    }

    #[test_log::test]
    fn test_configure_only_while_idle() {
        let (context, _hook) = context(4, 2);
        context.configure_buffer_size(8).unwrap();
        assert_eq!(context.get_total_buffer_size_mb(), 8);
        assert_eq!(context.per_cpu_capacity(), 4 * sizing::MIB);

        context.attach().unwrap();
        assert_eq!(
            context.configure_buffer_size(2),
            Err(CaptureError::AlreadyConfigured { clients: 1 })
        );
        assert_eq!(context.get_total_buffer_size_mb(), 8);
        context.detach();

        context.configure_buffer_size(2).unwrap();
        assert_eq!(context.get_total_buffer_size_mb(), 2);
    }

    #[test_log::test]
    fn test_rejected_size_keeps_previous() {
        let (context, _hook) = context(4, 2);
        assert!(context.configure_buffer_size(0).is_err());
        assert!(context.configure_buffer_size(4096).is_err());
        assert_eq!(context.get_total_buffer_size_mb(), 4);
    }

    #[test_log::test]
    fn test_descriptor_requires_capture() {
        let (context, _hook) = context(4, 2);
        assert_eq!(
            context.emit_device_descriptor(0, 1, "sda", 1 << 30),
            Err(CaptureError::NotCapturing)
        );
    }

    #[test_log::test]
    fn test_descriptor_is_readable() {
        let (context, _hook) = context(4, 2);
        context.attach().unwrap();
        context.emit_device_descriptor(1, 3, "nvme0n1", 1 << 30).unwrap();

        let mut consumer = context.consumer(1).unwrap();
        let event = consumer.read_event().unwrap().unwrap();
        assert_eq!(event.sequence_id(), 1);
        assert_eq!(context.last_sequence_id(), 1);
        assert!(consumer.read_event().unwrap().is_none());
        assert!(context.consumer(0).unwrap().read_event().unwrap().is_none());
        drop(consumer);
        context.detach();
    }

    #[test_log::test]
    fn test_single_reader_per_buffer() {
        let (context, _hook) = context(4, 2);
        assert_eq!(context.consumer(0).unwrap_err(), CaptureError::NotCapturing);

        context.attach().unwrap();
        let consumers = context.consumers().unwrap();
        assert_eq!(consumers.len(), 2);
        assert_eq!(context.consumer(0).unwrap_err(), CaptureError::Busy);
        assert!(matches!(
            context.consumer(2),
            Err(CaptureError::InvalidArgument(_))
        ));

        drop(consumers);
        assert!(context.consumer(0).is_ok());
        context.detach();
    }

    #[test_log::test]
    fn test_drop_stops_capture() {
        let (context, hook) = context(4, 2);
        context.attach().unwrap();
        drop(context);
        assert!(!hook.is_registered());
    }
}

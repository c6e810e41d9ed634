
use iotrace_capture::{
    CaptureConfig, CaptureContext, CaptureError, CaptureState, ControlSnapshot,
    InterceptionSource, IoCallback, IoDescriptor, IoHook, MIB, QueueId, TracedDevices,
    per_cpu_capacity, total_size_mb,
};
use rand::Rng;
use rstest::rstest;
use shared::{Harness, QUEUE, RecordingStorage, write_io};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn assert_consistent(snapshot: ControlSnapshot, cpus: usize) {
    if snapshot.clients > 0 {
        assert_eq!(snapshot.open_buffers, cpus, "{snapshot:?}");
        assert!(snapshot.callback_registered, "{snapshot:?}");
    } else {
        assert_eq!(snapshot.open_buffers, 0, "{snapshot:?}");
        assert!(!snapshot.callback_registered, "{snapshot:?}");
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
#[test_log::test]
fn test_nested_clients_register_once(#[case] clients: u32) {
    let harness = Harness::new(4, 2);

    for attached in 1..=clients {
        harness.context.attach().unwrap();
        assert_eq!(
            harness.context.state(),
            CaptureState::Capturing { clients: attached }
        );
    }
    assert_eq!(harness.hook.registrations(), 1);
    assert_eq!(harness.storage.outstanding(), 2);

    for _ in 0..clients {
        assert_eq!(harness.hook.unregistrations(), 0);
        harness.context.detach();
    }

    assert_eq!(harness.context.state(), CaptureState::Idle);
    assert_eq!(harness.hook.unregistrations(), 1);
    assert_eq!(harness.storage.outstanding(), 0);
    assert_eq!(harness.storage.released(), vec![0, 1]);
}

#[test_log::test]
fn test_sessions_can_restart() {
    let harness = Harness::new(4, 2);
    for _ in 0..3 {
        harness.start();
        assert!(harness.hook.is_registered());
        harness.context.detach();
        assert!(!harness.hook.is_registered());
        assert!(harness.devices.is_empty());
    }
    assert_eq!(harness.hook.registrations(), 3);
    assert_eq!(harness.hook.unregistrations(), 3);
}

#[test_log::test]
fn test_concurrent_attach_detach_stays_consistent() {
    const CPUS: usize = 4;
    let harness = Harness::new(4, CPUS);
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let context = harness.context.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut observed = 0u64;
            while !done.load(Ordering::Relaxed) {
                assert_consistent(context.control_snapshot(), CPUS);
                observed += 1;
            }
            observed
        })
    };

    let clients: Vec<_> = (0..8)
        .map(|_| {
            let context = harness.context.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut attached = 0u32;
                for _ in 0..500 {
                    if attached > 0 && rng.gen_bool(0.5) {
                        context.detach();
                        attached -= 1;
                    } else {
                        context.attach().unwrap();
                        attached += 1;
                    }
                }
                for _ in 0..attached {
                    context.detach();
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    assert!(observer.join().unwrap() > 0);

    assert_eq!(harness.context.state(), CaptureState::Idle);
    assert_consistent(harness.context.control_snapshot(), CPUS);
    assert_eq!(
        harness.hook.registrations(),
        harness.hook.unregistrations()
    );
    assert_eq!(harness.storage.outstanding(), 0);
}

#[test_log::test]
fn test_registration_failure_leaves_context_idle() {
    let harness = Harness::with(4, 3, IoHook::failing(), RecordingStorage::default());

    let err = harness.context.attach().unwrap_err();
    assert!(matches!(err, CaptureError::RegistrationFailure(_)));

    assert_eq!(harness.context.state(), CaptureState::Idle);
    assert_consistent(harness.context.control_snapshot(), 3);
    assert_eq!(harness.storage.outstanding(), 0);
    assert_eq!(harness.storage.released(), vec![0, 1, 2]);
}

struct Noop;

impl IoCallback for Noop {
    fn on_io(&self, _cpu: usize, _queue: QueueId, _io: &IoDescriptor) {}
}

#[test_log::test]
fn test_attach_works_after_registration_failure() {
    let harness = Harness::new(4, 2);
    harness.hook.register(Arc::new(Noop)).unwrap();

    assert!(matches!(
        harness.context.attach(),
        Err(CaptureError::RegistrationFailure(_))
    ));
    assert_eq!(harness.context.state(), CaptureState::Idle);
    assert_eq!(harness.storage.outstanding(), 0);

    harness.hook.unregister();
    harness.context.attach().unwrap();
    assert_consistent(harness.context.control_snapshot(), 2);
    assert_eq!(harness.storage.outstanding(), 2);
    harness.context.detach();
    assert_eq!(harness.storage.outstanding(), 0);
}

/// Interception source that keeps its own reference to the callback after unregistering
#[derive(Default)]
struct RetainingHook {
    inner: IoHook,
    kept: Mutex<Option<Arc<dyn IoCallback>>>,
}

impl InterceptionSource for RetainingHook {
    fn register(&self, callback: Arc<dyn IoCallback>) -> Result<(), CaptureError> {
        *self.kept.lock().unwrap() = Some(callback.clone());
        self.inner.register(callback)
    }

    fn unregister(&self) {
        self.inner.unregister();
    }
}

#[test_log::test]
fn test_detach_closes_buffers_still_referenced() {
    let hook = Arc::new(RetainingHook::default());
    let devices = Arc::new(TracedDevices::new());
    let storage = Arc::new(RecordingStorage::default());
    let config = CaptureConfig {
        buffer_size_mb: 4,
        cpus: Some(2),
        ..Default::default()
    };
    let context =
        CaptureContext::new(&config, hook.clone(), devices.clone(), storage.clone()).unwrap();

    context.attach().unwrap();
    devices.add(QUEUE).unwrap();
    let mut consumer = context.consumer(0).unwrap();
    assert!(consumer.is_producer_open());

    context.detach();
    assert!(!consumer.is_producer_open());
    assert_eq!(storage.outstanding(), 0);
    assert_eq!(storage.released(), vec![0, 1]);
    assert_consistent(context.control_snapshot(), 2);

    // The leftover reference can no longer write into the released buffers
    let kept = hook.kept.lock().unwrap().take().unwrap();
    devices.add(QUEUE).unwrap();
    kept.on_io(0, QUEUE, &write_io(1));
    assert_eq!(context.stats().total_pushed(), 0);
    assert!(consumer.read_event().unwrap().is_none());
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[test_log::test]
fn test_storage_failure_releases_earlier_buffers(#[case] failing_cpu: usize) {
    let harness = Harness::with(4, 4, IoHook::new(), RecordingStorage::failing_on(failing_cpu));

    let err = harness.context.attach().unwrap_err();
    assert!(matches!(err, CaptureError::OutOfMemory { cpu, .. } if cpu == failing_cpu));

    assert_eq!(harness.context.state(), CaptureState::Idle);
    assert!(!harness.hook.is_registered());
    assert_eq!(harness.hook.registrations(), 0);
    assert_eq!(harness.storage.outstanding(), 0);
    assert_eq!(
        harness.storage.released(),
        (0..failing_cpu).collect::<Vec<_>>()
    );
}

#[rstest]
#[case(1)]
#[case(3)]
#[test_log::test]
fn test_resize_refused_while_attached(#[case] clients: u32) {
    let harness = Harness::new(8, 4);
    for _ in 0..clients {
        harness.context.attach().unwrap();
    }

    assert_eq!(
        harness.context.configure_buffer_size(16),
        Err(CaptureError::AlreadyConfigured { clients })
    );
    assert_eq!(harness.context.get_total_buffer_size_mb(), 8);

    for _ in 0..clients {
        harness.context.detach();
    }
    harness.context.configure_buffer_size(16).unwrap();
    assert_eq!(harness.context.get_total_buffer_size_mb(), 16);
}

#[test_log::test]
fn test_resize_applies_to_next_session() {
    let harness = Harness::new(8, 4);
    harness.context.configure_buffer_size(4).unwrap();
    harness.context.attach().unwrap();

    let consumer = harness.context.consumer(2).unwrap();
    assert_eq!(consumer.capacity() as u64, MIB);
    drop(consumer);
    harness.context.detach();
}

#[rstest]
#[case(8, 4, 2 * MIB)]
#[case(1, 3, MIB / 3)]
#[case(1024, 1, 1024 * MIB)]
#[case(7, 2, 7 * MIB / 2)]
fn test_per_cpu_capacity(#[case] total_mb: u64, #[case] cpus: usize, #[case] expected: u64) {
    assert_eq!(per_cpu_capacity(total_mb, cpus, 1024).unwrap(), expected);
}

#[test]
fn test_per_cpu_capacity_bounds() {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let cpus = rng.gen_range(1..=256);
        let total_mb = rng.gen_range(1..=1024);
        let capacity = per_cpu_capacity(total_mb, cpus, 1024).unwrap();

        assert!(capacity > 0);
        assert!(capacity * cpus as u64 <= total_mb * MIB);
        assert!(total_size_mb(capacity, cpus) <= total_mb);
    }

    assert!(per_cpu_capacity(0, 4, 1024).is_err());
    assert!(per_cpu_capacity(1025, 4, 1024).is_err());
    assert!(per_cpu_capacity(4, 0, 1024).is_err());
}

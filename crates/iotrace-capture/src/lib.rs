//! Block I/O capture core: per-CPU trace buffers, the attach/detach control plane and the
//! producer path run for every intercepted I/O.

mod config;
mod context;
mod cpu;
mod error;
mod hook;
mod poller;
mod producer;
mod registry;
mod ring;
mod sequence;
mod sizing;
mod stats;
mod storage;

pub mod prelude;

pub use config::{CaptureConfig, DEFAULT_BUFFER_SIZE_MB, DEFAULT_MAX_BUFFER_SIZE_MB};
pub use context::{CaptureContext, CaptureState, ControlSnapshot};
pub use cpu::{current_cpu, monotonic_ns, online_cpus, pin_current_thread};
pub use error::CaptureError;
pub use hook::{Direction, InterceptionSource, IoCallback, IoDescriptor, IoHook};
pub use poller::{EventHandler, PollSummary, TracePoller};
pub use producer::{ProducerPath, classify};
pub use registry::{DeviceRegistry, MAX_TRACED_DEVICES, QueueId, TracedDevices};
pub use ring::{PinnedProducer, RingBufferHandle, RingConsumer, RingStorage};
pub use sequence::SequenceGenerator;
pub use sizing::{MIB, per_cpu_capacity, total_size_mb};
pub use stats::{CaptureStats, CpuStats, StatsSnapshot};
pub use storage::{BufferStorage, HeapStorage};

pub use iotrace_shared::{self as shared, Event, EventPayload, VersionInfo};

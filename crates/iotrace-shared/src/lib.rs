//! Types shared between the capture core and anything that reads its buffers.

pub mod event;
pub mod version;

pub use event::{
    DecodeError, DeviceDescriptor, DeviceName, Event, EventHeader, EventPayload, EventType,
    IoEvent, IoFlags, NameError, Operation,
};
pub use version::VersionInfo;

//! I/O interception seam.
//!
//! The capture core installs its producer path into an [`InterceptionSource`] once per
//! capture session. [`IoHook`] is the in-process source used by the `iotrace` front end and
//! the tests: whoever processes I/O submissions calls [`IoHook::submit`].

use crate::cpu;
use crate::error::CaptureError;
use crate::registry::QueueId;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Read,
    Write,
}

/// An I/O request as seen at submission time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoDescriptor {
    pub device_id: u32,
    /// First sector (512 bytes) of the request
    pub sector: u64,
    pub size_bytes: u32,
    pub direction: Direction,
    pub discard: bool,
    pub flush: bool,
    pub fua: bool,
    pub io_class: u32,
}

/// Called synchronously for every intercepted submission. Must not block.
pub trait IoCallback: Send + Sync {
    fn on_io(&self, cpu: usize, queue: QueueId, io: &IoDescriptor);
}

pub trait InterceptionSource: Send + Sync {
    fn register(&self, callback: Arc<dyn IoCallback>) -> Result<(), CaptureError>;

    /// Remove the callback. Must not return while an invocation is still running.
    fn unregister(&self);
}

#[derive(Default)]
pub struct IoHook {
    callback: RwLock<Option<Arc<dyn IoCallback>>>,
    refuse_registration: bool,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
}

impl IoHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that refuses every registration
    pub fn failing() -> Self {
        Self {
            refuse_registration: true,
            ..Self::default()
        }
    }

    /// Dispatch a submission to the installed callback. Returns whether one was installed.
    #[inline]
    pub fn submit(&self, cpu: usize, queue: QueueId, io: &IoDescriptor) -> bool {
        // The read side is held across the call so that unregister waits for us
        let callback = self.callback.read().unwrap_or_else(PoisonError::into_inner);
        match callback.as_ref() {
            Some(callback) => {
                callback.on_io(cpu, queue, io);
                true
            }
            None => false,
        }
    }

    /// Same as [`IoHook::submit`], using the CPU the caller runs on
    pub fn submit_current(&self, queue: QueueId, io: &IoDescriptor) -> bool {
        self.submit(cpu::current_cpu().unwrap_or(0), queue, io)
    }

    pub fn is_registered(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn unregistrations(&self) -> u64 {
        self.unregistrations.load(Ordering::Relaxed)
    }
}

impl InterceptionSource for IoHook {
    fn register(&self, callback: Arc<dyn IoCallback>) -> Result<(), CaptureError> {
        if self.refuse_registration {
            return Err(CaptureError::RegistrationFailure(
                "interception source refused the callback".to_string(),
            ));
        }

        let mut slot = self.callback.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(CaptureError::RegistrationFailure(
                "a callback is already registered".to_string(),
            ));
        }
        *slot = Some(callback);
        self.registrations.fetch_add(1, Ordering::Relaxed);
        debug!("I/O callback installed");

        Ok(())
    }

    fn unregister(&self) {
        let mut slot = self.callback.write().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            self.unregistrations.fetch_add(1, Ordering::Relaxed);
            debug!("I/O callback removed");
        }
    }
}

impl std::fmt::Debug for IoHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHook")
            .field("registered", &self.is_registered())
            .field("registrations", &self.registrations())
            .field("unregistrations", &self.unregistrations())
            .finish()
    }
}

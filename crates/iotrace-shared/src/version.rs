//! Event format identity exposed to consumers.
//!
//! WARNING: Consumers parse this descriptor to decide whether they understand the record
//! layout in [`crate::event`]. Bump the version whenever that layout changes.

pub const EVENT_VERSION_MAJOR: u32 = 1;
pub const EVENT_VERSION_MINOR: u32 = 0;
pub const EVENT_MAGIC: u64 = 0x494F_5452_4143_4531;

/// Upper bound of the rendered descriptor, in bytes
pub const VERSION_DESCRIPTOR_MAX_LEN: usize = 64;

/// Rendered once when a capture context starts and immutable afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    descriptor: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self::new(EVENT_VERSION_MAJOR, EVENT_VERSION_MINOR, EVENT_MAGIC)
    }

    fn new(major: u32, minor: u32, magic: u64) -> Self {
        Self {
            descriptor: format!("{major}\n{minor}\n{magic:016X}\n"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.descriptor
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.descriptor.as_bytes()
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.descriptor)
    }
}

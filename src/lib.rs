//! # cfstore - Security-Aware Configuration Store
//!
//! `cfstore` persists binary values under hierarchical key names on
//! chunk-addressed, power-loss-prone storage:
//!
//! - **Self-describing records** with header and tail checksums, no separate index on media
//! - **Generations**: every update is written beside the live value and made live on close
//! - **Recovery by scan**: torn writes are finalized or reclaimed at startup
//! - **Security contexts**: namespace prefixes with owner/other ACLs per key
//! - **Wildcard find**: resumable, ordered enumeration filtered by ACL
//!
//! ## Quick Start
//!
//! ```rust
//! use cfstore::{Acl, KeyDescriptor, Result, StoreBuilder};
//!
//! # fn main() -> Result<()> {
//! let mut store = StoreBuilder::new().memory(16 * 1024).build()?;
//! let ctx = store.register_context("com.acme")?;
//!
//! store.put(&ctx, "com.acme.wifi.essid", b"home", &KeyDescriptor::create(Acl::OWNER_RW))?;
//! let value = store.get(&ctx, "com.acme.wifi.essid")?.into_bytes()?;
//! assert_eq!(value, b"home");
//!
//! store.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Handles
//!
//! ```rust
//! use cfstore::{Acl, KeyDescriptor, Result, Status, StoreBuilder};
//!
//! # fn main() -> Result<()> {
//! let mut store = StoreBuilder::new().memory(16 * 1024).build()?;
//! let ctx = store.register_context("app")?;
//!
//! let h = store.open(&ctx, "app.motd", &KeyDescriptor::create(Acl::OWNER_RW))?;
//! store.write(h, b"hello ", 0)?;
//! store.write(h, b"world", 6)?;
//! store.close(h)?;
//!
//! let mut next = store.find(&ctx, "app.*", None)?;
//! while let Some(h) = next {
//!     let mut buf = [0u8; 64];
//!     let (n, status) = store.read(h, &mut buf)?;
//!     assert_eq!(&buf[..n], b"hello world");
//!     assert_eq!(status, Status::Success);
//!     next = store.find(&ctx, "app.*", Some(h))?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core resolve
pub(crate) use self::core::{
    acl, allocator, catalog, config, cursor, error, flags, fragment, io, record, recovery,
    validation, writer,
};

pub use crate::core::{
    acl::{AccessCheck, ContextId, KeyPattern, Operation, SecurityContext, Verdict},
    config::StoreConfig,
    cursor::{Handle, Whence},
    error::{strerror, CfstoreError, CorruptionKind, Result, Status},
    flags::{Acl, DataRetentionLevel, Ddsp, KeyMode, Permissions},
    fragment::Reassembly,
    io::{FileMedium, MemoryMedium, SharedImage, StorageDescriptor, StorageMedium},
    record::{Record, CHUNK_SIZE},
    recovery::RecoverySummary,
    store::{ConfigStore, KeyDescriptor, StoreStats},
    validation::{KeyName, Pde, KEY_NAME_MAX_LENGTH},
};

use std::path::{Path, PathBuf};
use tracing::info;

enum MediumSource {
    Provided(Box<dyn StorageMedium>),
    Memory(usize),
    File { path: PathBuf, capacity: u64 },
}

/// Builder for opening a [`ConfigStore`]
///
/// # Examples
///
/// ```rust,no_run
/// use cfstore::{StoreBuilder, StoreConfig};
///
/// # fn main() -> cfstore::Result<()> {
/// let store = StoreBuilder::new()
///     .file("/var/lib/device/config.img", 64 * 1024)
///     .config(StoreConfig::load("/etc/cfstore.toml")?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder {
    source: Option<MediumSource>,
    descriptor: StorageDescriptor,
    config: StoreConfig,
    extra: Vec<StorageDescriptor>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        StoreBuilder {
            source: None,
            descriptor: StorageDescriptor::default(),
            config: StoreConfig::default(),
            extra: Vec::new(),
        }
    }

    /// Run on a caller-supplied medium
    pub fn medium<M: StorageMedium + 'static>(mut self, medium: M) -> Self {
        self.source = Some(MediumSource::Provided(Box::new(medium)));
        self
    }

    /// Run on a fresh, erased in-memory medium of `capacity` bytes
    pub fn memory(mut self, capacity: usize) -> Self {
        self.source = Some(MediumSource::Memory(capacity));
        self
    }

    /// Run on an image file, creating it with `capacity` bytes if missing
    pub fn file<P: AsRef<Path>>(mut self, path: P, capacity: u64) -> Self {
        self.source = Some(MediumSource::File {
            path: path.as_ref().to_path_buf(),
            capacity,
        });
        self
    }

    /// Descriptor reported for memory and file media
    pub fn descriptor(mut self, descriptor: StorageDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Further media reported by [`ConfigStore::storage_detect`]
    pub fn extra_storage(mut self, descriptor: StorageDescriptor) -> Self {
        self.extra.push(descriptor);
        self
    }

    pub fn build(self) -> Result<ConfigStore> {
        let source = self
            .source
            .ok_or_else(|| CfstoreError::InvalidConfig("a storage medium must be set".to_string()))?;

        let medium: Box<dyn StorageMedium> = match source {
            MediumSource::Provided(medium) => medium,
            MediumSource::Memory(capacity) => {
                Box::new(MemoryMedium::new(capacity).with_descriptor(self.descriptor))
            }
            MediumSource::File { path, capacity } => {
                if path.exists() {
                    info!("Opening config store image {}", path.display());
                    Box::new(FileMedium::open(&path, self.descriptor)?)
                } else {
                    info!("Creating config store image {} ({} bytes)", path.display(), capacity);
                    Box::new(FileMedium::create(&path, capacity, self.descriptor)?)
                }
            }
        };

        ConfigStore::mount_with_descriptors(medium, self.config, self.extra)
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

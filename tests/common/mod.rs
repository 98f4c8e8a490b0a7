//! Shared helpers for integration tests

#![allow(dead_code)]

use cfstore::{
    CfstoreError, ConfigStore, Handle, MemoryMedium, SecurityContext, SharedImage, Status,
    StorageDescriptor, StorageMedium, StoreConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Route library logs to the test harness; filter with RUST_LOG
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A store whose medium outlives it, so tests can cut power and restart
pub struct Device {
    pub image: SharedImage,
    pub config: StoreConfig,
}

impl Device {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, StoreConfig::default())
    }

    pub fn with_config(capacity: usize, config: StoreConfig) -> Self {
        init_tracing();
        Device {
            image: SharedImage::erased(capacity),
            config,
        }
    }

    /// Boot a store on the current image, running recovery
    pub fn boot(&self) -> ConfigStore {
        let medium = MemoryMedium::with_image(self.image.clone(), StorageDescriptor::default());
        ConfigStore::mount(Box::new(medium), self.config.clone()).unwrap()
    }

    /// Boot a store whose program and erase calls go through `fuse`
    pub fn boot_with_fuse(&self, fuse: &Fuse) -> ConfigStore {
        let medium = FaultyMedium {
            inner: MemoryMedium::with_image(self.image.clone(), StorageDescriptor::default()),
            fuse: fuse.clone(),
        };
        ConfigStore::mount(Box::new(medium), self.config.clone()).unwrap()
    }
}

const UNARMED: usize = usize::MAX;

/// Budget of program/erase calls before the power goes out
///
/// Once blown, every later program or erase fails without touching the
/// image, so the image holds exactly what landed before the cut.
#[derive(Clone)]
pub struct Fuse {
    remaining: Arc<AtomicUsize>,
    blown: Arc<AtomicBool>,
}

impl Fuse {
    pub fn new() -> Self {
        Fuse {
            remaining: Arc::new(AtomicUsize::new(UNARMED)),
            blown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Allow `writes` more program/erase calls, then cut power
    pub fn arm(&self, writes: usize) {
        self.remaining.store(writes, Ordering::SeqCst);
    }

    pub fn is_blown(&self) -> bool {
        self.blown.load(Ordering::SeqCst)
    }

    fn spend(&self) -> cfstore::Result<()> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left == UNARMED {
            return Ok(());
        }
        if left == 0 {
            self.blown.store(true, Ordering::SeqCst);
            return Err(CfstoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "power cut",
            )));
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

/// Memory medium that stops accepting writes when its fuse blows
pub struct FaultyMedium {
    inner: MemoryMedium,
    fuse: Fuse,
}

impl StorageMedium for FaultyMedium {
    fn descriptor(&self) -> &StorageDescriptor {
        self.inner.descriptor()
    }

    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> cfstore::Result<()> {
        self.inner.read(offset, buf)
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> cfstore::Result<()> {
        self.fuse.spend()?;
        self.inner.program(offset, data)
    }

    fn erase(&mut self, offset: u64, len: u64) -> cfstore::Result<()> {
        self.fuse.spend()?;
        self.inner.erase(offset, len)
    }

    fn sync(&mut self) -> cfstore::Result<()> {
        self.inner.sync()
    }
}

/// Read everything left on a handle using a small buffer
pub fn read_to_end(store: &mut ConfigStore, handle: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 13];
    loop {
        let (n, status) = store.read(handle, &mut buf).unwrap();
        out.extend_from_slice(&buf[..n]);
        if status == Status::Success {
            return out;
        }
    }
}

/// Page through `find` to exhaustion, returning key names in visit order
pub fn find_all(store: &mut ConfigStore, ctx: &SecurityContext, pattern: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut previous = None;
    while let Some(handle) = store.find(ctx, pattern, previous).unwrap() {
        keys.push(store.key_name(handle).unwrap().to_string());
        previous = Some(handle);
    }
    keys
}

#![no_main]
use cfstore::{ConfigStore, MemoryMedium, SharedImage, StorageDescriptor, StoreConfig, CHUNK_SIZE};
use libfuzzer_sys::fuzz_target;

// Booting on any image must either fail cleanly or leave a store whose
// second boot finds nothing left to repair
fuzz_target!(|data: &[u8]| {
    let len = data.len() / CHUNK_SIZE * CHUNK_SIZE;
    if len == 0 {
        return;
    }
    let image = SharedImage::erased(len);
    image.write_raw(0, &data[..len]);

    let boot = || {
        let medium = MemoryMedium::with_image(image.clone(), StorageDescriptor::default());
        ConfigStore::mount(Box::new(medium), StoreConfig::default())
    };
    let Ok(first) = boot() else {
        return;
    };
    let live = first.recovery_summary().live_keys;
    drop(first);

    if let Ok(second) = boot() {
        let summary = second.recovery_summary();
        assert_eq!(summary.live_keys, live);
        assert_eq!(summary.finalized_on_recovery, 0);
        assert_eq!(summary.torn_writes, 0);
    }
});

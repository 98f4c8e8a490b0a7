//! Power loss at every stage of the write protocol
//!
//! Dropping a store without `shutdown` or `close` stands in for a power cut:
//! whatever reached the shared image is all the next boot gets to see.

mod common;

use cfstore::core::record::{FragmentLink, RecordFlags};
use cfstore::{
    Acl, CfstoreError, ConfigStore, Ddsp, KeyDescriptor, KeyName, Permissions, Record,
    SecurityContext, StoreConfig, CHUNK_SIZE,
};
use common::{read_to_end, Device, Fuse};

fn record(key: &str, value: &[u8], version: u32) -> Record {
    Record::new(
        KeyName::new(key).unwrap(),
        value.to_vec(),
        version,
        Permissions::new(Acl::OWNER_RW, Ddsp::empty()),
    )
}

fn finalized(mut record: Record) -> Record {
    record.flags |= RecordFlags::FINALIZED;
    record
}

#[test]
fn test_unclosed_create_is_discarded() {
    let device = Device::new(16 * 1024);
    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();

    let h = store.open(&ctx, "app.k", &KeyDescriptor::create(Acl::OWNER_RW)).unwrap();
    store.write(h, &[9u8; 1500], 0).unwrap();
    drop(store);

    let mut store = device.boot();
    let summary = store.recovery_summary().clone();
    assert_eq!(summary.live_keys, 0);
    assert_eq!(summary.reclaimed_generations, 1);
    assert!(summary.reclaimed_bytes > 1500);

    let ctx = store.register_context("app").unwrap();
    assert!(matches!(store.get(&ctx, "app.k"), Err(CfstoreError::NotFound(_))));
    let stats = store.stats();
    assert_eq!(stats.free_chunks, stats.total_chunks);
    // Reclaimed space really is erased
    assert!(device.image.snapshot().iter().all(|&b| b == 0xFF));
}

#[test]
fn test_unclosed_update_keeps_previous_value() {
    let device = Device::new(16 * 1024);
    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();
    store.put(&ctx, "app.k", b"committed", &KeyDescriptor::default()).unwrap();

    let h = store.open(&ctx, "app.k", &KeyDescriptor::default()).unwrap();
    store.write(h, &[1u8; 900], 0).unwrap();
    drop(store);

    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();
    assert_eq!(store.get(&ctx, "app.k").unwrap().into_bytes().unwrap(), b"committed");

    // The discarded generation's version is never handed out again
    store.put(&ctx, "app.k", b"next", &KeyDescriptor::default()).unwrap();
    let h = store.open(&ctx, "app.k", &KeyDescriptor::default()).unwrap();
    assert!(store.key_version(h).unwrap() > 2);
    assert_eq!(read_to_end(&mut store, h), b"next");
}

#[test]
fn test_lazy_data_never_flushed_is_lost() {
    let device = Device::new(16 * 1024);
    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();
    let desc = KeyDescriptor::create(Acl::OWNER_RW).with_mode(cfstore::KeyMode::LAZY_FLUSH);

    let h = store.open(&ctx, "app.k", &desc).unwrap();
    store.write(h, b"only in memory", 0).unwrap();
    drop(store);

    let store = device.boot();
    assert_eq!(store.recovery_summary().records_scanned, 0);
}

#[test]
fn test_interrupted_finalize_is_completed() {
    let device = Device::new(16 * 1024);

    // Two-fragment chain: terminal finalized, head still waiting for its flag
    let tail = finalized(record("app.k", b" world", 3));
    let mut head = record("app.k", b"hello", 3);
    let tail_chunk = 20u32;
    head.next = FragmentLink::At(tail_chunk);
    device.image.write_raw(0, &head.encode());
    device.image.write_raw(tail_chunk as usize * CHUNK_SIZE, &tail.encode());

    let mut store = device.boot();
    let summary = store.recovery_summary().clone();
    assert_eq!(summary.finalized_on_recovery, 1);
    assert_eq!(summary.live_keys, 1);

    let ctx = store.register_context("app").unwrap();
    assert_eq!(store.get(&ctx, "app.k").unwrap().into_bytes().unwrap(), b"hello world");
    drop(store);

    // Nothing left to finish on the next boot
    let store = device.boot();
    assert_eq!(store.recovery_summary().finalized_on_recovery, 0);
    assert_eq!(store.recovery_summary().live_keys, 1);
}

#[test]
fn test_chain_without_finalized_terminal_is_reclaimed() {
    let device = Device::new(16 * 1024);
    let old = finalized(record("app.k", b"old", 1));
    device.image.write_raw(0, &old.encode());

    // Head finalized but terminal not: the write never reached its commit point
    let mut head = finalized(record("app.k", b"new-", 2));
    head.next = FragmentLink::At(40);
    device.image.write_raw(20 * CHUNK_SIZE, &head.encode());
    device
        .image
        .write_raw(40 * CHUNK_SIZE, &record("app.k", b"value", 2).encode());

    let mut store = device.boot();
    assert_eq!(store.recovery_summary().reclaimed_generations, 1);
    let ctx = store.register_context("app").unwrap();
    assert_eq!(store.get(&ctx, "app.k").unwrap().into_bytes().unwrap(), b"old");
}

#[test]
fn test_torn_write_is_erased() {
    let device = Device::new(16 * 1024);
    let good = finalized(record("app.good", b"intact", 1));
    device.image.write_raw(0, &good.encode());

    // Header and key landed, value and tail did not
    let torn = record("app.torn", &[7u8; 64], 1).encode();
    let offset = 10 * CHUNK_SIZE;
    device.image.write_raw(offset, &torn[..48]);

    let mut store = device.boot();
    let summary = store.recovery_summary().clone();
    assert_eq!(summary.torn_writes, 1);
    assert_eq!(summary.live_keys, 1);
    assert!(device.image.snapshot()[offset..offset + torn.len()]
        .iter()
        .all(|&b| b == 0xFF));

    let ctx = store.register_context("app").unwrap();
    assert_eq!(store.get(&ctx, "app.good").unwrap().into_bytes().unwrap(), b"intact");
    assert!(matches!(store.get(&ctx, "app.torn"), Err(CfstoreError::NotFound(_))));
}

#[test]
fn test_shutdown_commits_open_writers() {
    let device = Device::new(16 * 1024);
    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();

    let h = store.open(&ctx, "app.k", &KeyDescriptor::create(Acl::OWNER_RW)).unwrap();
    store.write(h, b"saved by shutdown", 0).unwrap();
    store.shutdown().unwrap();

    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();
    assert_eq!(
        store.get(&ctx, "app.k").unwrap().into_bytes().unwrap(),
        b"saved by shutdown"
    );
}

#[test]
fn test_recovery_summary_serializes() {
    let device = Device::new(4096);
    let torn = record("app.torn", b"x", 1).encode();
    // Header plus key region, so the header checksum holds
    device.image.write_raw(0, &torn[..48]);

    let store = device.boot();
    let json = store.recovery_summary().to_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["torn_writes"], 1);
    assert_eq!(parsed["live_keys"], 0);
}

/// Small fragments so a 96 byte value spans three records
fn chained_device() -> Device {
    let config = StoreConfig {
        fragment_payload_max: 32,
        ..StoreConfig::default()
    };
    Device::with_config(16 * 1024, config)
}

/// Value of `app.k` after a reboot, or `None` if the key is gone
///
/// Panics if the value comes back truncated.
fn value_after_reboot(device: &Device) -> Option<Vec<u8>> {
    let mut store = device.boot();
    let ctx = store.register_context("app").unwrap();
    match store.get(&ctx, "app.k") {
        Ok(value) => {
            assert!(value.is_complete(), "truncated value {:?}", value.bytes);
            Some(value.bytes)
        }
        Err(CfstoreError::NotFound(_)) => None,
        Err(e) => panic!("unexpected error after reboot: {}", e),
    }
}

/// Cut power after every possible number of writes during `op`
///
/// `setup` runs with power on; `check` sees the rebooted device along with
/// whether `op` returned success. Stops once `op` finishes without the cut.
fn sweep_power_cuts<S, O, C>(setup: S, op: O, check: C)
where
    S: Fn(&mut ConfigStore, &SecurityContext),
    O: Fn(&mut ConfigStore, &SecurityContext) -> cfstore::Result<()>,
    C: Fn(&Device, bool),
{
    for budget in 0..64 {
        let device = chained_device();
        let fuse = Fuse::new();
        let mut store = device.boot_with_fuse(&fuse);
        let ctx = store.register_context("app").unwrap();
        setup(&mut store, &ctx);

        fuse.arm(budget);
        let succeeded = op(&mut store, &ctx).is_ok();
        drop(store);

        check(&device, succeeded);
        if !fuse.is_blown() {
            assert!(succeeded, "operation failed without a power cut");
            return;
        }
    }
    panic!("operation still cut short after 64 writes");
}

#[test]
fn test_power_cut_during_chained_delete() {
    let value = vec![0x5Au8; 96];
    sweep_power_cuts(
        |store, ctx| {
            store.put(ctx, "app.k", &value, &KeyDescriptor::default()).unwrap();
        },
        |store, ctx| store.delete(ctx, "app.k").map(|_| ()),
        |device, succeeded| {
            // Either untouched or gone, never a shortened chain
            if let Some(bytes) = value_after_reboot(device) {
                assert!(!succeeded);
                assert_eq!(bytes, value);
            }
        },
    );
}

#[test]
fn test_power_cut_during_delete_never_revives_older_generation() {
    sweep_power_cuts(
        |store, ctx| {
            store.put(ctx, "app.k", b"old", &KeyDescriptor::default()).unwrap();
            // Keep the first generation on the medium as garbage
            store.open(ctx, "app.k", &KeyDescriptor::default()).unwrap();
            store.put(ctx, "app.k", b"new", &KeyDescriptor::default()).unwrap();
        },
        |store, ctx| store.delete(ctx, "app.k").map(|_| ()),
        |device, succeeded| {
            let after = value_after_reboot(device);
            assert_ne!(after.as_deref(), Some(&b"old"[..]));
            if succeeded {
                assert_eq!(after, None);
            }
        },
    );
}

#[test]
fn test_power_cut_during_chained_update() {
    let old = vec![1u8; 80];
    let new = vec![2u8; 112];
    sweep_power_cuts(
        |store, ctx| {
            store.put(ctx, "app.k", &old, &KeyDescriptor::default()).unwrap();
        },
        |store, ctx| store.put(ctx, "app.k", &new, &KeyDescriptor::default()),
        |device, succeeded| {
            let after = value_after_reboot(device).expect("key lost by an update");
            if succeeded {
                assert_eq!(after, new);
            } else {
                assert!(after == old || after == new);
            }
        },
    );
}

#[test]
fn test_power_cut_during_chained_create() {
    let value = vec![3u8; 96];
    sweep_power_cuts(
        |_, _| {},
        |store, ctx| store.put(ctx, "app.k", &value, &KeyDescriptor::default()),
        |device, succeeded| match value_after_reboot(device) {
            Some(bytes) => assert_eq!(bytes, value),
            None => assert!(!succeeded),
        },
    );
}

#[test]
fn test_power_cut_during_reclaim() {
    let old = vec![4u8; 96];
    let new = vec![5u8; 64];
    sweep_power_cuts(
        |store, ctx| {
            store.put(ctx, "app.k", &old, &KeyDescriptor::default()).unwrap();
            let reader = store.open(ctx, "app.k", &KeyDescriptor::default()).unwrap();
            store.put(ctx, "app.k", &new, &KeyDescriptor::default()).unwrap();
            store.close(reader).unwrap();
        },
        |store, _| store.reclaim().map(|_| ()),
        |device, _| {
            assert_eq!(value_after_reboot(device), Some(new.clone()));
        },
    );
}

#![no_main]
use cfstore::{Acl, ConfigStore, KeyDescriptor, MemoryMedium, SharedImage, StorageDescriptor, StoreConfig};
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use std::collections::BTreeMap;

#[derive(Debug, Arbitrary)]
enum Op {
    Put { key: u8, data: Vec<u8> },
    Delete { key: u8 },
    Restart,
}

fn key_name(key: u8) -> String {
    format!("fuzz.k{}", key % 8)
}

fn boot(image: &SharedImage) -> ConfigStore {
    let medium = MemoryMedium::with_image(image.clone(), StorageDescriptor::default());
    match ConfigStore::mount(Box::new(medium), StoreConfig::default()) {
        Ok(store) => store,
        Err(e) => panic!("boot failed on a store-written image: {}", e),
    }
}

// Committed values must match a model map across restarts
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let image = SharedImage::erased(16 * 1024);
    let mut store = boot(&image);
    let mut ctx = store.register_context("fuzz").unwrap();
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for op in ops.iter().take(32) {
        match op {
            Op::Put { key, data } => {
                let name = key_name(*key);
                let desc = KeyDescriptor::create(Acl::OWNER_RW);
                if store.put(&ctx, &name, data, &desc).is_ok() {
                    model.insert(name, data.clone());
                }
            }
            Op::Delete { key } => {
                let name = key_name(*key);
                let deleted = store.delete(&ctx, &name).is_ok();
                assert_eq!(deleted, model.remove(&name).is_some());
            }
            Op::Restart => {
                drop(store);
                store = boot(&image);
                ctx = store.register_context("fuzz").unwrap();
            }
        }
    }

    for (key, value) in &model {
        let got = store.get(&ctx, key).unwrap().into_bytes().unwrap();
        assert_eq!(&got, value);
    }
});

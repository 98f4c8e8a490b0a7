#![no_main]
use cfstore::core::record::{self, Slot};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the decoder, and anything it accepts
// must survive a re-encode unchanged
fuzz_target!(|data: &[u8]| {
    if let Ok(Slot::Record(rec)) = record::decode(data) {
        let bytes = rec.encode();
        assert_eq!(bytes.len(), rec.encoded_len());
        assert_eq!(record::decode(&bytes), Ok(Slot::Record(rec)));
    }
});

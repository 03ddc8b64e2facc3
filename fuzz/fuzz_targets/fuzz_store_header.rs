#![no_main]

use evmount_core::cow::StoreHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = StoreHeader::decode(data) {
        let encoded = header.encode();
        assert_eq!(StoreHeader::decode(&encoded).ok(), Some(header));
    }
});

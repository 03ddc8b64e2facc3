#![no_main]

use evmount_core::ewf::chunk::decode_payload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let compressed = data[0] & 1 == 1;
    let expected = u16::from_le_bytes([data[1], data[2]]) as usize;
    let mut out = Vec::new();
    if decode_payload(0, &data[3..], compressed, expected, &mut out).is_ok() {
        assert_eq!(out.len(), expected);
    }
});

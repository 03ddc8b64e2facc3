#![no_main]

use evmount_core::ewf::table_cache::OffsetTable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let expected = u16::from_le_bytes([data[0], data[1]]) as u32;
    if let Ok(table) = OffsetTable::parse(&data[2..], expected) {
        for i in 0..table.len() {
            let _ = table.entry(i);
        }
    }
});

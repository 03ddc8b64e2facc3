#![no_main]

use evmount_core::ewf::SectionIter;
use evmount_core::ewf::format::FILE_HEADER_SIZE;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let sections = SectionIter::new(Cursor::new(data), FILE_HEADER_SIZE as u64).with_limit(256);
    for section in sections {
        if section.is_err() {
            break;
        }
    }
});

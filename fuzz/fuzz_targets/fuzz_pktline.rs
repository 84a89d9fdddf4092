//! Fuzz target for pkt-line decoding and side-band demultiplexing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = weir_git::PktLineReader::new(Cursor::new(data));

    // Bounded: every packet consumes at least four bytes.
    for _ in 0..data.len() / 4 + 1 {
        match reader.read() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let _ = weir_git::demux(data);
});

//! Fuzz target for pack parsing.
//!
//! The parser must reject malformed packs with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weir_storage::ObjectStore;

fuzz_target!(|data: &[u8]| {
    let store = ObjectStore::new();
    let _ = weir_git::PackParser::new(&store)
        .max_object_size(Some(1 << 20))
        .parse(data);
});

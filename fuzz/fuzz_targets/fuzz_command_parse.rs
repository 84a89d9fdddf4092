//! Fuzz target for the first command line and plain command lines.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weir_git::{FirstLine, ReceiveCommand};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let first = FirstLine::parse(line);
    if let Ok(cmd) = ReceiveCommand::parse(&first.line) {
        assert_eq!(cmd.ref_name(), &first.line[82..]);
    }
    let _ = weir_git::is_valid_ref_name(line);
});

#![no_main]

use docwire::client::ConnectionInfo;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(info) = ConnectionInfo::parse(s) {
        assert!(!info.hosts.is_empty());
        if let Some(size) = info.max_pool_size {
            assert!(size >= 1);
        }
    }

    // Exercise the parameter parser even when the fuzzer misses the scheme
    let _ = ConnectionInfo::parse(&format!("mongodb://localhost/?{}", s));
});

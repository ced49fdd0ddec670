#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = logrelay::LogEvent::decode(data) {
        let mut out = Vec::new();
        event.render(&mut out).unwrap();
        assert!(out.ends_with(b"\n"));
    }
});

#![no_main]

use bytes::{BufMut, BytesMut};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buffer = BytesMut::new();
    buffer.put(data);
    while let Ok(Some(_frame)) = logrelay::frame::parse_frame(&mut buffer, 1 << 20) {}
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_protocol::utils::compression::{deflate, inflate, StreamInflater};

fuzz_target!(|data: &[u8]| {
    // Round trip arbitrary input
    if let Ok(compressed) = deflate(data) {
        let _ = inflate(&compressed, data.len());
    }

    // Malformed streams must fail cleanly and respect the size limit
    let _ = inflate(data, 1024 * 1024);

    let mut inflater = StreamInflater::new();
    for chunk in data.chunks(97) {
        if inflater.push(chunk).is_err() {
            return;
        }
    }
    let _ = inflater.finish();
});

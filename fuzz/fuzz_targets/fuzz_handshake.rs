#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use relay_protocol::core::envelope;
use relay_protocol::core::unpacker::Unpacker;
use relay_protocol::protocol::handshake::parse_auth_reply;

fuzz_target!(|data: &[u8]| {
    // Authentication replies in both layouts
    let _ = parse_auth_reply(&mut Unpacker::new(data.to_vec()), false);
    let _ = parse_auth_reply(&mut Unpacker::new(data.to_vec()), true);

    // Relay envelopes
    let _ = envelope::decode(Bytes::copy_from_slice(data));
});

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use relay_protocol::core::codec::FrameCodec;
use relay_protocol::core::unpacker::Unpacker;
use relay_protocol::protocol::wire;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame decoding with a small limit
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buffer = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buffer) {}

    // Field readers used by the packet parsers
    let _ = wire::unpack_download_chunk(&mut Unpacker::new(data.to_vec()));
    let _ = wire::unpack_send_result(&mut Unpacker::new(data.to_vec()));
    let _ = wire::unpack_update_listing(&mut Unpacker::new(data.to_vec()));
    let _ = wire::unpack_requested_conversation(&mut Unpacker::new(data.to_vec()));
    let _ = wire::unpack_preview_conversation(&mut Unpacker::new(data.to_vec()));
});

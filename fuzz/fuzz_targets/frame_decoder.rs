//! Fuzz target for incremental frame decoding
//!
//! Feeds arbitrary bytes to the decoder in arbitrary chunk sizes. The decoder
//! must never panic, never yield a payload above its limit, and must decode
//! the same frames however the input is split.

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use conduit_core::{FrameCodec, Framing};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    four_byte: bool,
    max_frame_size: u16,
    chunk: u8,
    data: Vec<u8>,
}

fn decode_whole(codec: &FrameCodec, data: &[u8]) -> Vec<bytes::Bytes> {
    let mut buf = BytesMut::from(data);
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        frames.push(frame);
    }
    frames
}

fuzz_target!(|input: Input| {
    let framing = if input.four_byte {
        Framing::FourByte
    } else {
        Framing::VariableLength
    };
    let codec = FrameCodec::new(framing, usize::from(input.max_frame_size));
    let whole = decode_whole(&codec, &input.data);

    let chunk = usize::from(input.chunk).max(1);
    let mut buf = BytesMut::new();
    let mut chunked = Vec::new();
    'feed: for piece in input.data.chunks(chunk) {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => chunked.push(frame),
                Ok(None) => break,
                Err(_) => break 'feed,
            }
        }
    }

    for frame in whole.iter().chain(chunked.iter()) {
        assert!(frame.len() <= codec.max_frame_size());
    }
    assert_eq!(whole, chunked);
});

#![no_main]

use bytes::BytesMut;
use docwire::protocol::{decode_frontend_message, decode_message, decode_negotiation};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() >= 8 {
        let _ = decode_negotiation(&data[..8]);
    }

    // Both directions, several frames per segment
    let mut backend = BytesMut::from(data);
    while !backend.is_empty() {
        match decode_message(&mut backend) {
            Ok((_, consumed)) if consumed > 0 => {
                let _ = backend.split_to(consumed);
            }
            _ => break,
        }
    }

    let mut frontend = BytesMut::from(data);
    while !frontend.is_empty() {
        match decode_frontend_message(&mut frontend) {
            Ok((_, consumed)) if consumed > 0 => {
                let _ = frontend.split_to(consumed);
            }
            _ => break,
        }
    }
});

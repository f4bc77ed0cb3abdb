#![no_main]

use bytes::BytesMut;
use docwire::protocol::{decode_message, encode_backend_message, BackendMessage, ServerStatus};
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

/// Status replies re-framed and delivered in arbitrary chunks
#[derive(Debug)]
struct ChunkedReplies {
    replies: Vec<ServerStatus>,
    split_points: Vec<u16>,
}

impl<'a> Arbitrary<'a> for ChunkedReplies {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        let count = u.int_in_range(1..=8)?;
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(ServerStatus {
                is_primary: u.arbitrary()?,
                secondary: u.arbitrary()?,
                set_name: u.arbitrary()?,
                hosts: u.arbitrary()?,
                primary: u.arbitrary()?,
                me: None,
            });
        }
        Ok(Self {
            replies,
            split_points: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ChunkedReplies| {
    let mut wire = Vec::new();
    for status in &input.replies {
        let frame = encode_backend_message(&BackendMessage::Status(status.clone()))
            .expect("status replies always encode");
        wire.extend_from_slice(&frame);
    }

    let mut splits: Vec<usize> = input
        .split_points
        .iter()
        .map(|&p| p as usize % (wire.len() + 1))
        .collect();
    splits.push(0);
    splits.push(wire.len());
    splits.sort_unstable();
    splits.dedup();

    // Decoding must yield every reply in order no matter how the bytes arrive
    let mut decoded = Vec::new();
    let mut buf = BytesMut::new();
    for window in splits.windows(2) {
        buf.extend_from_slice(&wire[window[0]..window[1]]);
        while let Ok((msg, consumed)) = decode_message(&mut buf) {
            let _ = buf.split_to(consumed);
            decoded.push(msg);
        }
    }

    assert!(buf.is_empty());
    let expected: Vec<BackendMessage> = input
        .replies
        .into_iter()
        .map(BackendMessage::Status)
        .collect();
    assert_eq!(decoded, expected);
});

use bytes::BytesMut;
use gyre_core::frame::{DecodeLimits, Frame, FrameParser};
use gyre_core::message::{Message, MessageAssembler};
use gyre_core::protocol::Opcode;
use proptest::prelude::*;

/// Split `payload` into fragments at the given cut points and encode them as
/// masked client frames.
fn fragment(payload: &[u8], cuts: &[usize], opcode: Opcode) -> Vec<u8> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (payload.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut wire = BytesMut::new();
    let mut start = 0;
    let mut first = true;
    for end in points.into_iter().chain(std::iter::once(payload.len())) {
        if end < start {
            continue;
        }
        let op = if first { opcode } else { Opcode::Continuation };
        let is_last = end == payload.len();
        Frame::new(op, payload[start..end].to_vec())
            .fin(is_last)
            .masked()
            .write_to(&mut wire);
        first = false;
        start = end;
        if is_last {
            break;
        }
    }
    wire.to_vec()
}

proptest! {
    #[test]
    fn fragmented_message_reassembles_exactly_once(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
        chunk in 1usize..512,
    ) {
        let wire = fragment(&payload, &cuts, Opcode::Binary);

        let mut parser = FrameParser::new(DecodeLimits::default());
        let mut assembler = MessageAssembler::default();
        let mut messages = Vec::new();

        for piece in wire.chunks(chunk) {
            parser.feed(piece);
            while let Some(frame) = parser.next_frame().unwrap() {
                if let Some(message) = assembler.push(frame).unwrap() {
                    messages.push(message);
                }
            }
        }

        prop_assert_eq!(messages.len(), 1);
        prop_assert_eq!(&messages[0], &Message::binary(payload));
        prop_assert_eq!(parser.buffered_bytes(), 0);
        prop_assert!(!assembler.is_assembling());
    }

    #[test]
    fn text_fragments_survive_split_code_points(
        text in "\\PC{0,200}",
        cuts in proptest::collection::vec(any::<usize>(), 0..6),
    ) {
        let wire = fragment(text.as_bytes(), &cuts, Opcode::Text);

        let mut parser = FrameParser::default();
        parser.feed(&wire);
        let mut assembler = MessageAssembler::default();
        let mut result = None;
        for frame in parser.drain().unwrap() {
            if let Some(message) = assembler.push(frame).unwrap() {
                prop_assert!(result.is_none());
                result = Some(message);
            }
        }

        prop_assert_eq!(result, Some(Message::text(text)));
    }

    #[test]
    fn header_length_encoding_matches_payload(len in 0usize..70_000) {
        let bytes = Frame::binary(vec![7u8; len]).masked().to_bytes();
        let mut buf = BytesMut::from(&bytes[..]);
        let limits = DecodeLimits { max_frame_size: 1 << 20, require_mask: true };
        let frame = Frame::parse(&mut buf, &limits).unwrap();
        prop_assert_eq!(frame.payload.len(), len);
        prop_assert!(buf.is_empty());
    }
}

//! Property-based tests for the query parser, the frame emitter and frame
//! encoding.

use bytes::BytesMut;
use proptest::prelude::*;
use wsconform::protocol::{Frame, OpCode, apply_mask};
use wsconform::scenario::reserved_bits::{
    IGNORED_MESSAGE, ReservedBit, ReservedBitsQuery, build_frame,
};

fn data_opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![
        Just(OpCode::Text),
        Just(OpCode::Binary),
        Just(OpCode::Continuation),
    ]
}

proptest! {
    #[test]
    fn test_query_suffix_parses_under_any_path(
        path in "/[a-z/]{0,30}",
        compressed in any::<bool>(),
        digit in 0u8..=9,
    ) {
        let resource = format!("{path}?compressed={compressed}&bitNumber={digit}");
        let query = ReservedBitsQuery::parse(&resource);
        prop_assert_eq!(query, Some(ReservedBitsQuery { compressed, bit_number: digit }));
    }

    #[test]
    fn test_query_with_trailing_garbage_never_parses(
        compressed in any::<bool>(),
        digit in 0u8..=9,
        tail in "[a-zA-Z0-9&=]{1,10}",
    ) {
        let resource = format!("/x?compressed={compressed}&bitNumber={digit}{tail}");
        prop_assert_eq!(ReservedBitsQuery::parse(&resource), None);
    }

    #[test]
    fn test_query_parser_never_panics(resource in "\\PC{0,64}") {
        let _ = ReservedBitsQuery::parse(&resource);
    }

    #[test]
    fn test_emitted_frame_has_at_most_one_reserved_bit(bit in any::<u8>()) {
        let frame = build_frame(bit);
        let set = [frame.rsv1, frame.rsv2, frame.rsv3].iter().filter(|b| **b).count();

        prop_assert!(frame.fin);
        prop_assert_eq!(frame.opcode, OpCode::Text);
        match ReservedBit::from_number(bit) {
            Some(_) => {
                prop_assert_eq!(set, 1);
                prop_assert_eq!(frame.payload(), IGNORED_MESSAGE.as_bytes());
            }
            None => {
                prop_assert_eq!(set, 0);
                let expected = format!("FAIL: Invalid bit number: {bit}");
                prop_assert_eq!(frame.payload(), expected.as_bytes());
            }
        }
    }

    #[test]
    fn test_reserved_bits_survive_encoding(
        rsv in (any::<bool>(), any::<bool>(), any::<bool>()),
        fin in any::<bool>(),
        opcode in data_opcode_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..300),
        mask in proptest::option::of(any::<[u8; 4]>()),
    ) {
        let frame = Frame::new(fin, opcode, payload.clone()).with_rsv(rsv.0, rsv.1, rsv.2);
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf, mask);
        prop_assert_eq!(buf.len(), frame.wire_size(mask.is_some()));

        let (parsed, used) = Frame::parse(&buf).unwrap();
        prop_assert_eq!(used, buf.len());
        prop_assert_eq!((parsed.rsv1, parsed.rsv2, parsed.rsv3), rsv);
        prop_assert_eq!(parsed.fin, fin);
        prop_assert_eq!(parsed.masked, mask.is_some());
        prop_assert_eq!(parsed.payload(), &payload[..]);
    }

    #[test]
    fn test_parse_truncated_never_panics(
        payload in prop::collection::vec(any::<u8>(), 0..200),
        cut in 0usize..210,
    ) {
        let encoded = Frame::binary(payload).encode();
        let cut = cut.min(encoded.len());
        let _ = Frame::parse(&encoded[..cut]);
    }

    #[test]
    fn test_mask_is_involution(
        data in prop::collection::vec(any::<u8>(), 0..100),
        mask in any::<[u8; 4]>(),
    ) {
        let mut masked = data.clone();
        apply_mask(&mut masked, mask);
        apply_mask(&mut masked, mask);
        prop_assert_eq!(masked, data);
    }
}

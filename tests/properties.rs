use bytes::BytesMut;
use proptest::prelude::*;

use pollframe::frame::{FrameParser, OpCode, encode_frame};
use pollframe::mask::{apply_mask, apply_mask_offset};
use pollframe::selector::WakeupSignal;

fn data_opcode() -> impl Strategy<Value = OpCode> {
    prop_oneof![Just(OpCode::Text), Just(OpCode::Binary), Just(OpCode::Continuation)]
}

fn control_opcode() -> impl Strategy<Value = OpCode> {
    prop_oneof![Just(OpCode::Ping), Just(OpCode::Pong), Just(OpCode::Close)]
}

proptest! {
    #[test]
    fn data_frames_round_trip(
        opcode in data_opcode(),
        payload in proptest::collection::vec(any::<u8>(), 0..70_000),
        fin in any::<bool>(),
        mask in proptest::option::of(any::<[u8; 4]>()),
    ) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, &payload, fin, mask);

        let mut parser = FrameParser::new(1 << 20, mask.is_some());
        let frame = parser.parse(&mut buf).unwrap().unwrap();

        prop_assert_eq!(frame.opcode(), opcode);
        prop_assert_eq!(frame.is_final(), fin);
        prop_assert_eq!(frame.is_masked(), mask.is_some());
        prop_assert_eq!(frame.payload.as_ref(), &payload[..]);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn control_frames_round_trip(
        opcode in control_opcode(),
        payload in proptest::collection::vec(any::<u8>(), 0..=125),
        mask in proptest::option::of(any::<[u8; 4]>()),
    ) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, &payload, true, mask);

        let mut parser = FrameParser::new(1 << 20, mask.is_some());
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        prop_assert_eq!(frame.opcode(), opcode);
        prop_assert_eq!(frame.payload.as_ref(), &payload[..]);
    }

    #[test]
    fn parsing_is_independent_of_chunking(
        payload in proptest::collection::vec(any::<u8>(), 0..2_000),
        chunk in 1usize..64,
    ) {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Binary, &payload, true, Some([9, 8, 7, 6]));

        let mut parser = FrameParser::new(1 << 20, true);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = parser.parse(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].payload.as_ref(), &payload[..]);
    }

    #[test]
    fn masking_is_an_involution(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        key in any::<[u8; 4]>(),
    ) {
        let mut masked = data.clone();
        apply_mask(&mut masked, key);
        apply_mask(&mut masked, key);
        prop_assert_eq!(masked, data);
    }

    #[test]
    fn split_masking_matches_whole(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        key in any::<[u8; 4]>(),
        split in any::<prop::sample::Index>(),
    ) {
        let at = split.index(data.len());
        let mut whole = data.clone();
        apply_mask(&mut whole, key);

        let mut parts = data.clone();
        let (head, tail) = parts.split_at_mut(at);
        apply_mask_offset(head, key, 0);
        apply_mask_offset(tail, key, at);
        prop_assert_eq!(parts, whole);
    }

    #[test]
    fn wakeup_signals_coalesce(signals in 1usize..200) {
        let wakeup = WakeupSignal::new().unwrap();
        for _ in 0..signals {
            wakeup.signal();
        }
        prop_assert_eq!(wakeup.pending(), 1);

        wakeup.check().unwrap();
        prop_assert_eq!(wakeup.pending(), 0);

        // The next signal writes again
        wakeup.signal();
        prop_assert_eq!(wakeup.pending(), 1);
    }
}

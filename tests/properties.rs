//! Property tests for the codec and lane invariants.
//!
//! Random frames must survive encode→decode byte-exactly regardless of
//! how the octet stream is fragmented, and lane state must hold the
//! credit and sequencing guarantees under arbitrary operation orders.

use bytes::Bytes;
use proptest::prelude::*;

use rabbit_engine::protocol::{Frame, FrameBuffer, StartLine, Verb};
use rabbit_engine::tunnel::{Lane, Opener, SendDecision};

fn arb_verb() -> impl Strategy<Value = Verb> {
    prop_oneof![
        Just(Verb::Hello),
        Just(Verb::List),
        Just(Verb::Fetch),
        Just(Verb::Search),
        Just(Verb::Describe),
        Just(Verb::Subscribe),
        Just(Verb::Publish),
        Just(Verb::Event),
        Just(Verb::Offer),
        Just(Verb::Ping),
        Just(Verb::Ack),
        Just(Verb::Credit),
        Just(Verb::Cancel),
    ]
}

prop_compose! {
    fn arb_selector()(segments in prop::collection::vec("[a-z0-9]{1,8}", 0..3)) -> String {
        if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/0/{}", segments.join("/"))
        }
    }
}

prop_compose! {
    fn arb_header()(
        key in "[A-Za-z][A-Za-z0-9-]{0,15}",
        value in "[ -~]{0,40}",
    ) -> (String, String) {
        // A leading space would be eaten by the "Key: value" convention.
        (key, value.trim_start_matches(' ').to_string())
    }
}

prop_compose! {
    fn arb_request()(
        verb in arb_verb(),
        selector in arb_selector(),
        headers in prop::collection::vec(arb_header(), 0..6),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) -> Frame {
        let mut frame = Frame::request_with(verb, selector);
        for (key, value) in headers {
            // Length/Transfer are framing headers the encoder owns.
            if key.eq_ignore_ascii_case("Length")
                || key.eq_ignore_ascii_case("Transfer")
                || key.eq_ignore_ascii_case("View")
            {
                continue;
            }
            frame.set_header(&key, value);
        }
        frame.body = Bytes::from(body);
        frame
    }
}

prop_compose! {
    fn arb_response()(
        code in 200u16..600,
        phrase in "[A-Z][A-Z-]{0,12}",
        lane in 0u16..1024,
        body in prop::collection::vec(any::<u8>(), 0..128),
    ) -> Frame {
        let mut frame = Frame::request(Verb::Ping);
        frame.start = StartLine::Response { code, phrase };
        frame.set_lane(lane);
        frame.body = Bytes::from(body);
        frame
    }
}

/// Stamp the Length header the way the encoder will, so decoded frames
/// compare equal.
fn canonical(mut frame: Frame) -> Frame {
    if !frame.body.is_empty() && frame.header("Length").is_none() && !frame.is_chunked() {
        frame.set_header("Length", frame.body.len().to_string());
    }
    frame
}

proptest! {
    #[test]
    fn prop_roundtrip_requests(frame in arb_request()) {
        let wire = frame.encode();
        let mut buffer = FrameBuffer::new();
        let decoded = buffer.push(&wire).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &canonical(frame));
        prop_assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn prop_roundtrip_responses(frame in arb_response()) {
        let wire = frame.encode();
        let decoded = FrameBuffer::new().push(&wire).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &canonical(frame));
    }

    #[test]
    fn prop_fragmentation_invariant(
        frames in prop::collection::vec(arb_request(), 1..5),
        cuts in prop::collection::vec(1usize..64, 0..8),
    ) {
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode());
        }
        // Split the stream at arbitrary points and feed the pieces.
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        let mut rest: &[u8] = &wire;
        for cut in cuts {
            let cut = cut.min(rest.len());
            let (piece, tail) = rest.split_at(cut);
            decoded.extend(buffer.push(piece).unwrap());
            rest = tail;
        }
        decoded.extend(buffer.push(rest).unwrap());

        let expected: Vec<Frame> = frames.into_iter().map(canonical).collect();
        prop_assert_eq!(decoded, expected);
        prop_assert!(buffer.finish().is_ok());
    }

    /// Credit safety: frames released never exceed initial + granted.
    #[test]
    fn prop_credit_never_exceeded(
        initial in 0u32..8,
        ops in prop::collection::vec(
            prop_oneof![
                Just(LaneOp::Send),
                (1u32..4).prop_map(LaneOp::Grant),
            ],
            0..64,
        ),
    ) {
        let mut lane = Lane::new(1, Opener::Local, initial);
        let mut sent = 0u64;
        let mut granted = u64::from(initial);
        for op in ops {
            match op {
                LaneOp::Send => {
                    let frame = Frame::request_with(Verb::Event, "/q/t");
                    if matches!(lane.try_send(frame, true), SendDecision::Send(_)) {
                        sent += 1;
                    }
                }
                LaneOp::Grant(n) => {
                    granted += u64::from(n);
                    sent += lane.grant_send_credit(n).len() as u64;
                }
            }
            prop_assert!(sent <= granted, "sent {} > granted {}", sent, granted);
        }
    }

    /// Monotone seq: released frames are stamped 1, 2, 3, … with no gaps,
    /// regardless of how sends interleave with grants.
    #[test]
    fn prop_seq_monotone_no_gaps(
        ops in prop::collection::vec(
            prop_oneof![
                Just(LaneOp::Send),
                (1u32..4).prop_map(LaneOp::Grant),
            ],
            1..64,
        ),
    ) {
        let mut lane = Lane::new(1, Opener::Local, 1);
        let mut seqs = Vec::new();
        for op in ops {
            match op {
                LaneOp::Send => {
                    let frame = Frame::request_with(Verb::Event, "/q/t");
                    if let SendDecision::Send(frame) = lane.try_send(frame, true) {
                        seqs.push(frame.seq().unwrap());
                    }
                }
                LaneOp::Grant(n) => {
                    for frame in lane.grant_send_credit(n) {
                        seqs.push(frame.seq().unwrap());
                    }
                }
            }
        }
        for (i, seq) in seqs.iter().enumerate() {
            prop_assert_eq!(*seq, i as u64 + 1);
        }
    }

    /// Cumulative ack: peer_ack is monotone non-decreasing under any ack
    /// order, including duplicates and regressions.
    #[test]
    fn prop_ack_monotone(acks in prop::collection::vec(0u64..64, 0..64)) {
        let mut lane = Lane::new(1, Opener::Local, 4);
        let mut high = 0;
        for ack in acks {
            lane.record_peer_ack(ack);
            high = high.max(ack);
            prop_assert_eq!(lane.peer_ack(), high);
        }
    }
}

#[derive(Debug, Clone)]
enum LaneOp {
    Send,
    Grant(u32),
}

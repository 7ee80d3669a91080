//! Property-based tests for the wire codecs.
//!
//! These verify the protocol invariants for ALL valid inputs, not just
//! specific examples: codec round-trips, KISS escape idempotence, AX.25
//! address symmetry, id determinism and fragmentation completeness.

use proptest::prelude::*;
use rfmp_proto::{
    Ax25Address, Ax25Frame, FragFrame, Fragmenter, KissDecoder, KissFrame, MsgFrame, ReqFrame,
    RfmpFrame, SyncFrame, generate_message_id,
};

/// Strategy for valid message ids (8-12 lowercase hex).
fn arbitrary_message_id() -> impl Strategy<Value = String> {
    "[0-9a-f]{8,12}"
}

/// Strategy for valid channel names.
fn arbitrary_channel() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,20}"
}

/// Strategy for valid callsigns.
fn arbitrary_callsign() -> impl Strategy<Value = String> {
    "[A-Z0-9]{1,6}"
}

/// Strategy for wire timestamps. Dates stay in safe ranges so they are both
/// shape-valid and parseable.
fn arbitrary_timestamp() -> impl Strategy<Value = String> {
    (1990u32..2100, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60, 0u32..60).prop_map(
        |(y, mo, d, h, mi, s)| format!("{y:04}{mo:02}{d:02}T{h:02}{mi:02}{s:02}Z"),
    )
}

/// Strategy for bodies: printable ASCII without the `|` delimiter.
fn arbitrary_body() -> impl Strategy<Value = String> {
    "[ -{}~]{1,200}"
}

fn arbitrary_msg() -> impl Strategy<Value = MsgFrame> {
    (
        arbitrary_message_id(),
        arbitrary_callsign(),
        arbitrary_timestamp(),
        arbitrary_channel(),
        0u8..=3,
        proptest::option::of(arbitrary_message_id()),
        arbitrary_body(),
    )
        .prop_map(|(id, from, timestamp, channel, priority, reply_to, body)| MsgFrame {
            id,
            from,
            timestamp,
            channel,
            priority,
            reply_to,
            body,
        })
}

fn arbitrary_frag() -> impl Strategy<Value = FragFrame> {
    (arbitrary_message_id(), 1u32..=32, proptest::collection::vec(any::<u8>(), 1..160))
        .prop_flat_map(|(message_id, total, data)| {
            (Just(message_id), 0..total, Just(total), Just(data))
        })
        .prop_map(|(message_id, idx, total, data)| FragFrame { message_id, idx, total, data })
}

fn arbitrary_sync() -> impl Strategy<Value = SyncFrame> {
    (
        arbitrary_callsign(),
        proptest::collection::vec(any::<u8>(), 32),
        proptest::collection::vec(any::<u8>(), 32),
        proptest::collection::vec(any::<u8>(), 32),
        0u8..3,
    )
        .prop_map(|(from, bf0, bf1, bf2, window_index)| SyncFrame {
            from,
            filters: [bf0, bf1, bf2],
            window_index,
        })
}

fn arbitrary_req() -> impl Strategy<Value = ReqFrame> {
    (
        arbitrary_callsign(),
        arbitrary_message_id(),
        proptest::option::of(proptest::collection::vec(0u32..64, 1..8)),
    )
        .prop_map(|(from, message_id, missing)| ReqFrame { from, message_id, missing })
}

fn arbitrary_frame() -> impl Strategy<Value = RfmpFrame> {
    prop_oneof![
        arbitrary_msg().prop_map(RfmpFrame::Msg),
        arbitrary_frag().prop_map(RfmpFrame::Frag),
        arbitrary_sync().prop_map(RfmpFrame::Sync),
        arbitrary_req().prop_map(RfmpFrame::Req),
    ]
}

#[test]
fn prop_rfmp_frame_round_trip() {
    proptest!(|(frame in arbitrary_frame())| {
        let wire = frame.encode();
        let decoded = RfmpFrame::decode(&wire).expect("valid frame should decode");

        // PROPERTY: decode(encode(r)) == r for every valid frame.
        prop_assert_eq!(decoded, frame);
    });
}

#[test]
fn prop_kiss_escape_idempotence() {
    proptest!(|(payload in proptest::collection::vec(any::<u8>(), 0..512))| {
        // Arbitrary bytes, explicitly including FEND/FESC runs, survive the
        // escape/unescape cycle.
        let frame = KissFrame::data(0, payload.clone());
        let wire = frame.encode();

        let mut decoder = KissDecoder::new();
        let frames = decoder.extend(&wire);

        if payload.is_empty() {
            // A data frame always has at least the command byte, so even an
            // empty payload round-trips.
            prop_assert_eq!(frames.len(), 1);
            prop_assert!(frames[0].data.is_empty());
        } else {
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames[0].data.as_ref(), payload.as_slice());
        }
    });
}

#[test]
fn prop_kiss_stream_reassembles_across_chunks() {
    proptest!(|(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..64),
            1..8,
        ),
        split in 1usize..32,
    )| {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&KissFrame::data(0, payload.clone()).encode());
        }

        let mut decoder = KissDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(split) {
            frames.extend(decoder.extend(chunk));
        }

        prop_assert_eq!(frames.len(), payloads.len());
        for (frame, payload) in frames.iter().zip(&payloads) {
            prop_assert_eq!(frame.data.as_ref(), payload.as_slice());
        }
    });
}

#[test]
fn prop_ax25_address_symmetry() {
    proptest!(|(callsign in arbitrary_callsign(), ssid in 0u8..=15)| {
        let addr = Ax25Address::new(&callsign, ssid).expect("valid address");

        let last = addr.encode(true);
        let not_last = addr.encode(false);

        // PROPERTY: the end bit is the only difference between chain
        // positions, and decode inverts encode.
        prop_assert_eq!(last[6] & 0x01, 1);
        prop_assert_eq!(not_last[6] & 0x01, 0);

        let decoded = Ax25Address::decode(&last).expect("decode");
        prop_assert_eq!(decoded.callsign(), callsign.as_str());
        prop_assert_eq!(decoded.ssid(), ssid);
    });
}

#[test]
fn prop_ax25_frame_round_trip() {
    proptest!(|(
        source in arbitrary_callsign(),
        ssid in 0u8..=15,
        info in proptest::collection::vec(any::<u8>(), 0..256),
    )| {
        let frame = Ax25Frame::ui(
            Ax25Address::new(&source, ssid).expect("valid"),
            Ax25Address::new("RFMP", 0).expect("valid"),
            info.clone(),
        );

        let decoded = Ax25Frame::decode(&frame.encode()).expect("decode");
        prop_assert_eq!(decoded, frame);
    });
}

#[test]
fn prop_message_id_determinism() {
    proptest!(|(
        sender in "[A-Za-z0-9]{1,12}",
        timestamp in arbitrary_timestamp(),
        body in arbitrary_body(),
    )| {
        let first = generate_message_id(&sender, &timestamp, &body);
        let second = generate_message_id(&sender, &timestamp, &body);

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 12);
        prop_assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
    });
}

#[test]
fn prop_fragmentation_completeness() {
    proptest!(|(body_len in 150usize..900, threshold in 120usize..300)| {
        let msg = MsgFrame {
            id: "abcdef012345".to_string(),
            from: "N0CALL".to_string(),
            timestamp: "20260801T120000Z".to_string(),
            channel: "general".to_string(),
            priority: 1,
            reply_to: None,
            body: "y".repeat(body_len),
        };

        let fragmenter = Fragmenter::new(threshold);
        let encoded = RfmpFrame::Msg(msg.clone()).encode();
        let fragments = fragmenter.fragment(&msg);

        if encoded.len() <= threshold {
            prop_assert!(fragments.is_empty());
        } else {
            // PROPERTY: ceil(L / (threshold - 50)) fragments whose
            // concatenation is the original encoding.
            let chunk = threshold - 50;
            prop_assert_eq!(fragments.len(), encoded.len().div_ceil(chunk));

            let rejoined: Vec<u8> =
                fragments.iter().flat_map(|f| f.data.clone()).collect();
            prop_assert_eq!(rejoined, encoded);

            let decoded =
                RfmpFrame::decode(&RfmpFrame::Msg(msg.clone()).encode()).expect("decode");
            prop_assert_eq!(decoded, RfmpFrame::Msg(msg));
        }
    });
}

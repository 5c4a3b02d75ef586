use bytes::{Bytes, BytesMut};
use janus_rs::protocol::{codec, CodecError, Frame, FrameDecoder, FrameKind, RequestRecord, ResponseRecord};
use uuid::Uuid;

fn all_kinds() -> Vec<FrameKind> {
    vec![
        FrameKind::Req,
        FrameKind::Resp,
        FrameKind::ReqBody,
        FrameKind::RespBody,
        FrameKind::ReqEnd,
        FrameKind::RespEnd,
        FrameKind::Cancel,
        FrameKind::Ping,
        FrameKind::Pong,
        FrameKind::WorkerReady,
        FrameKind::Drain,
    ]
}

#[test]
fn decode_encode_is_identity_for_every_kind() {
    let mut decoder = FrameDecoder::new(1024 * 1024);
    for kind in all_kinds() {
        let frame = Frame::new(kind, Uuid::new_v4(), Bytes::from_static(b"payload"));
        let wire = codec::encode(&frame, 1024 * 1024).unwrap();
        decoder.extend(&wire);
        assert_eq!(decoder.decode_next().unwrap().unwrap(), frame);
    }
}

#[test]
fn empty_payload_frames_round_trip() {
    let frame = Frame::control(FrameKind::ReqEnd, Uuid::new_v4());
    let wire = codec::encode(&frame, 64).unwrap();
    assert_eq!(wire.len(), 4 + 17);

    let mut decoder = FrameDecoder::new(64);
    decoder.extend(&wire);
    assert_eq!(decoder.decode_next().unwrap().unwrap(), frame);
}

#[test]
fn request_record_payload_round_trips() {
    let record = RequestRecord {
        method: "POST".to_string(),
        path: "/api/users/42".to_string(),
        query: vec![("page".to_string(), "2".to_string())],
        headers: vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("x-janus-session".to_string(), "opaque".to_string()),
        ],
        peer_ip: "10.0.0.9".to_string(),
        deadline_ms: 1_234_567,
    };
    let frame = Frame::new(
        FrameKind::Req,
        Uuid::new_v4(),
        Bytes::from(serde_json::to_vec(&record).unwrap()),
    );
    let wire = codec::encode(&frame, 1 << 20).unwrap();

    let mut decoder = FrameDecoder::new(1 << 20);
    decoder.extend(&wire);
    let decoded = decoder.decode_next().unwrap().unwrap();
    let parsed: RequestRecord = serde_json::from_slice(&decoded.payload).unwrap();
    assert_eq!(parsed, record);
}

#[test]
fn response_record_payload_round_trips() {
    let record = ResponseRecord {
        status: 201,
        headers: vec![("location".to_string(), "/api/users/43".to_string())],
    };
    let frame = Frame::new(
        FrameKind::Resp,
        Uuid::new_v4(),
        Bytes::from(serde_json::to_vec(&record).unwrap()),
    );
    let wire = codec::encode(&frame, 1 << 20).unwrap();

    let mut decoder = FrameDecoder::new(1 << 20);
    decoder.extend(&wire);
    let decoded = decoder.decode_next().unwrap().unwrap();
    let parsed: ResponseRecord = serde_json::from_slice(&decoded.payload).unwrap();
    assert_eq!(parsed, record);
}

#[test]
fn byte_at_a_time_delivery_still_decodes() {
    let frame = Frame::new(FrameKind::RespBody, Uuid::new_v4(), Bytes::from(vec![7u8; 300]));
    let wire = codec::encode(&frame, 1 << 20).unwrap();

    let mut decoder = FrameDecoder::new(1 << 20);
    for byte in wire.iter() {
        assert!(decoder
            .decode_next()
            .unwrap()
            .is_none());
        decoder.extend(&[*byte]);
    }
    assert_eq!(decoder.decode_next().unwrap().unwrap(), frame);
}

#[test]
fn interleaved_correlations_preserve_per_frame_identity() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let frames = vec![
        Frame::new(FrameKind::ReqBody, a, Bytes::from_static(b"a1")),
        Frame::new(FrameKind::ReqBody, b, Bytes::from_static(b"b1")),
        Frame::new(FrameKind::ReqEnd, a, Bytes::new()),
        Frame::new(FrameKind::ReqEnd, b, Bytes::new()),
    ];

    let mut wire = BytesMut::new();
    for frame in &frames {
        wire.extend_from_slice(&codec::encode(frame, 1 << 20).unwrap());
    }

    let mut decoder = FrameDecoder::new(1 << 20);
    decoder.extend(&wire);
    for expected in &frames {
        assert_eq!(&decoder.decode_next().unwrap().unwrap(), expected);
    }
}

#[test]
fn wire_layout_matches_the_contract() {
    let correlation = Uuid::new_v4();
    let frame = Frame::new(FrameKind::Cancel, correlation, Bytes::from_static(b"xy"));
    let wire = codec::encode(&frame, 1 << 20).unwrap();

    // [len][kind][correlation][payload]
    assert_eq!(&wire[0..4], &(19u32).to_be_bytes());
    assert_eq!(wire[4], 0x07);
    assert_eq!(&wire[5..21], correlation.as_bytes());
    assert_eq!(&wire[21..], b"xy");
}

#[test]
fn oversize_and_malformed_are_terminal() {
    let mut decoder = FrameDecoder::new(32);
    decoder.extend(&(100u32).to_be_bytes());
    assert!(matches!(
        decoder.decode_next(),
        Err(CodecError::OversizeFrame { size: 100, max: 32 })
    ));

    let mut decoder = FrameDecoder::new(32);
    decoder.extend(&(3u32).to_be_bytes());
    assert!(matches!(
        decoder.decode_next(),
        Err(CodecError::MalformedLength { len: 3 })
    ));
}

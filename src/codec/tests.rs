//! Codec tests against hand-assembled wire bytes

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use super::{read_variable_int, write_variable_int};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Ack, ConnAck, Connect, DecodeError, Disconnect, Packet, ProtocolVersion, Publish, QoS,
    ReasonCode,
};

fn encode(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new(version).encode(packet, &mut buf).unwrap();
    buf
}

fn decode_one(buf: &[u8], version: ProtocolVersion) -> Packet {
    let (packet, used) = Decoder::new()
        .with_protocol_version(version)
        .decode(buf)
        .unwrap()
        .expect("complete packet");
    assert_eq!(used, buf.len());
    packet
}

#[test_case(0, &[0x00])]
#[test_case(127, &[0x7F])]
#[test_case(128, &[0x80, 0x01])]
#[test_case(16_383, &[0xFF, 0x7F])]
#[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01])]
fn variable_int_wire_form(value: u32, wire: &[u8]) {
    let mut buf = BytesMut::new();
    write_variable_int(&mut buf, value).unwrap();
    assert_eq!(&buf[..], wire);
    assert_eq!(read_variable_int(wire).unwrap(), (value, wire.len()));
}

#[test]
fn variable_int_rejects_five_bytes() {
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
    assert_eq!(read_variable_int(&[0x80]), Err(DecodeError::InsufficientData));
}

#[test]
fn connect_v311_with_credentials_layout() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "ab".to_string(),
        clean_start: true,
        keep_alive: 30,
        session_expiry_interval: None,
        username: Some("u".to_string()),
        password: Some(Bytes::from_static(b"p")),
    }));
    let buf = encode(&packet, ProtocolVersion::V311);

    let expected: &[u8] = &[
        0x10, 20, // fixed header
        0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol name + level
        0xC2, // username, password, clean session
        0x00, 30, // keep alive
        0x00, 0x02, b'a', b'b', // client id
        0x00, 0x01, b'u', // username
        0x00, 0x01, b'p', // password
    ];
    assert_eq!(&buf[..], expected);

    // The server side learns the level from CONNECT itself
    let mut decoder = Decoder::new();
    let (decoded, _) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(decoded, packet);
    assert_eq!(decoder.protocol_version(), Some(ProtocolVersion::V311));
}

#[test]
fn connect_v5_carries_empty_properties() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "c".to_string(),
        ..Default::default()
    }));
    let buf = encode(&packet, ProtocolVersion::V5);
    // level, flags, keep alive, property length
    assert_eq!(&buf[8..13], &[0x05, 0x02, 0x00, 60, 0x00]);

    let mut decoder = Decoder::new();
    let (decoded, _) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(decoded, packet);
    assert_eq!(decoder.protocol_version(), Some(ProtocolVersion::V5));
}

#[test]
fn connect_v5_session_expiry_property() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "c".to_string(),
        clean_start: false,
        session_expiry_interval: Some(3600),
        ..Default::default()
    }));
    let buf = encode(&packet, ProtocolVersion::V5);
    // level, flags, keep alive, property length, session expiry
    assert_eq!(
        &buf[8..18],
        &[0x05, 0x00, 0x00, 60, 0x05, 0x11, 0x00, 0x00, 0x0E, 0x10]
    );

    let mut decoder = Decoder::new();
    let (decoded, _) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(decoded, packet);
}

#[test]
fn connect_v311_ignores_session_expiry() {
    let packet = Connect {
        clean_start: false,
        session_expiry_interval: Some(3600),
        ..Default::default()
    };
    let buf = encode(&Packet::Connect(Box::new(packet.clone())), ProtocolVersion::V311);

    let (decoded, _) = Decoder::new().decode(&buf).unwrap().unwrap();
    assert_eq!(
        decoded,
        Packet::Connect(Box::new(Connect {
            session_expiry_interval: None,
            ..packet
        }))
    );
}

#[test]
fn connect_password_is_redacted_in_debug() {
    let connect = Connect {
        password: Some(Bytes::from_static(b"hunter2")),
        ..Default::default()
    };
    let rendered = format!("{:?}", connect);
    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}

#[test_case(0x00, ReasonCode::SUCCESS)]
#[test_case(0x04, ReasonCode::BAD_USERNAME_OR_PASSWORD)]
#[test_case(0x05, ReasonCode::NOT_AUTHORIZED)]
#[test_case(0x42, ReasonCode::UNSPECIFIED_ERROR)]
fn connack_v311_return_codes(code: u8, expected: ReasonCode) {
    let packet = decode_one(&[0x20, 0x02, 0x00, code], ProtocolVersion::V311);
    assert_eq!(
        packet,
        Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code: expected,
        })
    );
}

#[test]
fn connack_v5_skips_properties() {
    // session present, success, 3 bytes of properties (receive maximum = 10)
    let packet = decode_one(
        &[0x20, 0x06, 0x01, 0x00, 0x03, 0x21, 0x00, 0x0A],
        ProtocolVersion::V5,
    );
    assert_eq!(
        packet,
        Packet::ConnAck(ConnAck {
            session_present: true,
            reason_code: ReasonCode::SUCCESS,
        })
    );
}

#[test]
fn publish_qos1_flags_and_packet_id() {
    let publish = Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "a/b".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(b"{}"),
    };
    let buf = encode(&Packet::Publish(publish.clone()), ProtocolVersion::V311);
    assert_eq!(buf[0], 0x3B);
    assert_eq!(&buf[2..9], &[0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07]);
    assert_eq!(
        decode_one(&buf, ProtocolVersion::V311),
        Packet::Publish(publish)
    );
}

#[test]
fn publish_qos1_without_packet_id_is_refused() {
    let publish = Publish {
        qos: QoS::AtLeastOnce,
        topic: "t".to_string(),
        ..Default::default()
    };
    let mut buf = BytesMut::new();
    let err = Encoder::new(ProtocolVersion::V311)
        .encode(&Packet::Publish(publish), &mut buf)
        .unwrap_err();
    assert_eq!(err.to_string(), "QoS > 0 publish without packet identifier");
}

#[test]
fn publish_qos0_with_dup_is_malformed() {
    let result = Decoder::new()
        .with_protocol_version(ProtocolVersion::V311)
        .decode(&[0x38, 0x03, 0x00, 0x01, b't']);
    assert_eq!(result, Err(DecodeError::InvalidFlags));
}

#[test]
fn puback_v311_and_v5_reason() {
    assert_eq!(
        decode_one(&[0x40, 0x02, 0x00, 0x05], ProtocolVersion::V311),
        Packet::PubAck(Ack::new(5))
    );

    let rejected = decode_one(&[0x40, 0x03, 0x00, 0x05, 0x87], ProtocolVersion::V5);
    match rejected {
        Packet::PubAck(ack) => {
            assert_eq!(ack.packet_id, 5);
            assert!(ack.reason_code.is_error());
            assert_eq!(ack.reason_code.to_string(), "not authorized (0x87)");
        }
        other => panic!("unexpected packet {:?}", other),
    }
}

#[test]
fn v5_ack_reason_is_only_written_on_failure() {
    let ok = encode(&Packet::PubAck(Ack::new(1)), ProtocolVersion::V5);
    assert_eq!(&ok[..], &[0x40, 0x02, 0x00, 0x01]);

    let nack = Ack {
        packet_id: 1,
        reason_code: ReasonCode::QUOTA_EXCEEDED,
    };
    let buf = encode(&Packet::PubRec(nack), ProtocolVersion::V5);
    assert_eq!(&buf[..], &[0x50, 0x04, 0x00, 0x01, 0x97, 0x00]);
    assert_eq!(decode_one(&buf, ProtocolVersion::V5), Packet::PubRec(nack));
}

#[test]
fn pubrel_requires_reserved_flags() {
    let buf = encode(&Packet::PubRel(Ack::new(9)), ProtocolVersion::V311);
    assert_eq!(buf[0], 0x62);

    let result = Decoder::new()
        .with_protocol_version(ProtocolVersion::V311)
        .decode(&[0x60, 0x02, 0x00, 0x09]);
    assert_eq!(result, Err(DecodeError::InvalidFlags));
}

#[test]
fn ping_and_disconnect() {
    assert_eq!(&encode(&Packet::PingReq, ProtocolVersion::V311)[..], &[0xC0, 0x00]);
    assert_eq!(
        decode_one(&[0xD0, 0x00], ProtocolVersion::V311),
        Packet::PingResp
    );
    assert_eq!(
        decode_one(&[0xE0, 0x01, 0x8B], ProtocolVersion::V5),
        Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::SERVER_SHUTTING_DOWN
        })
    );
}

#[test]
fn partial_packets_wait_for_more_data() {
    let buf = encode(
        &Packet::Publish(Publish {
            topic: "plant/line1".to_string(),
            payload: Bytes::from_static(b"21.5"),
            ..Default::default()
        }),
        ProtocolVersion::V311,
    );
    let mut decoder = Decoder::new().with_protocol_version(ProtocolVersion::V311);
    for cut in 0..buf.len() {
        assert_eq!(decoder.decode(&buf[..cut]).unwrap(), None, "cut at {}", cut);
    }
    assert!(decoder.decode(&buf).unwrap().is_some());
}

#[test]
fn oversized_packets_are_rejected_before_buffering() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(
        decoder.decode(&[0x30, 0x80, 0x01]),
        Err(DecodeError::PacketTooLarge)
    );
}

#[test]
fn unsupported_packet_types() {
    // SUBSCRIBE is outside the client subset
    let result = Decoder::new().decode(&[0x82, 0x00]);
    assert_eq!(result, Err(DecodeError::InvalidPacketType(8)));
}

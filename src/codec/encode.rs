//! MQTT packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, PROPERTY_SESSION_EXPIRY_INTERVAL};
use crate::protocol::{
    Ack, ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, Publish, QoS,
    ReasonCode,
};

/// MQTT packet encoder
///
/// v5.0 packets are written with empty property sections, except for the
/// session expiry interval on CONNECT.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let header = match packet {
            Packet::Connect(p) => {
                self.connect_body(p, &mut body)?;
                0x10
            }
            Packet::ConnAck(p) => {
                self.connack_body(p, &mut body);
                0x20
            }
            Packet::Publish(p) => self.publish_body(p, &mut body)?,
            Packet::PubAck(ack) => {
                self.ack_body(ack, &mut body);
                0x40
            }
            Packet::PubRec(ack) => {
                self.ack_body(ack, &mut body);
                0x50
            }
            // PUBREL carries the reserved flag bits 0010
            Packet::PubRel(ack) => {
                self.ack_body(ack, &mut body);
                0x62
            }
            Packet::PubComp(ack) => {
                self.ack_body(ack, &mut body);
                0x70
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(p) => {
                self.disconnect_body(p, &mut body);
                0xE0
            }
        };

        buf.reserve(body.len() + 5);
        buf.put_u8(header);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn connect_body(&self, packet: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, "MQTT")?;
        body.put_u8(packet.protocol_version as u8);

        let mut flags: u8 = 0;
        if packet.clean_start {
            flags |= 0x02;
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(packet.keep_alive);

        if packet.protocol_version == ProtocolVersion::V5 {
            match packet.session_expiry_interval {
                Some(interval) => {
                    body.put_u8(5);
                    body.put_u8(PROPERTY_SESSION_EXPIRY_INTERVAL);
                    body.put_u32(interval);
                }
                None => body.put_u8(0),
            }
        }

        write_string(body, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(body, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn connack_body(&self, packet: &ConnAck, body: &mut BytesMut) {
        body.put_u8(packet.session_present as u8);
        if self.is_v5() {
            body.put_u8(packet.reason_code.0);
            body.put_u8(0);
        } else {
            body.put_u8(packet.reason_code.to_v3_connack_code());
        }
    }

    /// Returns the fixed header byte, which carries the publish flags
    fn publish_body(&self, packet: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
        write_string(body, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            let id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
            body.put_u16(id);
        }
        if self.is_v5() {
            body.put_u8(0);
        }
        body.put_slice(&packet.payload);

        let mut header = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            header |= 0x08;
        }
        if packet.retain {
            header |= 0x01;
        }
        Ok(header)
    }

    fn ack_body(&self, ack: &Ack, body: &mut BytesMut) {
        body.put_u16(ack.packet_id);
        // v5.0 allows omitting the reason code when it is success
        if self.is_v5() && ack.reason_code != ReasonCode::SUCCESS {
            body.put_u8(ack.reason_code.0);
            body.put_u8(0);
        }
    }

    fn disconnect_body(&self, packet: &Disconnect, body: &mut BytesMut) {
        if self.is_v5() && packet.reason_code != ReasonCode::SUCCESS {
            body.put_u8(packet.reason_code.0);
            body.put_u8(0);
        }
    }
}

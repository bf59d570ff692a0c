//! MQTT packet decoder

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE,
    PROPERTY_SESSION_EXPIRY_INTERVAL,
};
use crate::protocol::{
    Ack, ConnAck, Connect, DecodeError, Disconnect, Packet, ProtocolVersion, Publish, QoS,
    ReasonCode,
};

/// MQTT packet decoder
///
/// v5.0 property sections are validated for length and skipped.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
    /// Protocol level; learned from CONNECT when acting as the server side
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version: None,
        }
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = Some(version);
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode one packet from the front of the buffer
    ///
    /// Returns `Ok(None)` until a complete packet is buffered, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let packet_type = buf[0] >> 4;
        let flags = buf[0] & 0x0F;

        let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        if remaining as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total = 1 + len_bytes + remaining as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let body = &buf[1 + len_bytes..total];

        let expect_flags = |expected: u8| {
            if flags == expected {
                Ok(())
            } else {
                Err(DecodeError::InvalidFlags)
            }
        };

        let packet = match packet_type {
            1 => {
                expect_flags(0)?;
                self.decode_connect(body)?
            }
            2 => {
                expect_flags(0)?;
                self.decode_connack(body)?
            }
            3 => self.decode_publish(flags, body)?,
            4 => {
                expect_flags(0)?;
                Packet::PubAck(self.decode_ack(body)?)
            }
            5 => {
                expect_flags(0)?;
                Packet::PubRec(self.decode_ack(body)?)
            }
            6 => {
                expect_flags(0x02)?;
                Packet::PubRel(self.decode_ack(body)?)
            }
            7 => {
                expect_flags(0)?;
                Packet::PubComp(self.decode_ack(body)?)
            }
            12 => {
                expect_flags(0)?;
                Packet::PingReq
            }
            13 => {
                expect_flags(0)?;
                Packet::PingResp
            }
            14 => {
                expect_flags(0)?;
                self.decode_disconnect(body)?
            }
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total)))
    }

    /// Skip a v5.0 property section, returning the bytes it occupied
    fn skip_properties(&self, buf: &[u8]) -> Result<usize, DecodeError> {
        if !self.is_v5() {
            return Ok(0);
        }
        let (len, used) = read_variable_int(buf)
            .map_err(|_| DecodeError::MalformedPacket("truncated property length"))?;
        let end = used + len as usize;
        if end > buf.len() {
            return Err(DecodeError::MalformedPacket("properties overrun packet"));
        }
        Ok(end)
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let (name, mut pos) = read_string(body)?;
        if name != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing protocol level"))?;
        let version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(version);
        pos += 1;

        let flags = *body
            .get(pos)
            .ok_or(DecodeError::MalformedPacket("missing connect flags"))?;
        if flags & 0x01 != 0 {
            return Err(DecodeError::MalformedPacket("reserved connect flag set"));
        }
        if flags & 0x04 != 0 {
            return Err(DecodeError::MalformedPacket("will messages are not supported"));
        }
        pos += 1;

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;
        let properties = self.skip_properties(&body[pos..])?;
        let session_expiry_interval = session_expiry(&body[pos..pos + properties]);
        pos += properties;

        let (client_id, used) = read_string(&body[pos..])?;
        pos += used;

        let username = if flags & 0x80 != 0 {
            let (s, used) = read_string(&body[pos..])?;
            pos += used;
            Some(s.to_string())
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            let (raw, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(raw))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id: client_id.to_string(),
            clean_start: flags & 0x02 != 0,
            keep_alive,
            session_expiry_interval,
            username,
            password,
        })))
    }

    fn decode_connack(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let [ack_flags, code, rest @ ..] = body else {
            return Err(DecodeError::MalformedPacket("short CONNACK"));
        };
        let reason_code = if self.is_v5() {
            self.skip_properties(rest)?;
            ReasonCode(*code)
        } else {
            ReasonCode::from_v3_connack_code(*code)
        };
        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let dup = flags & 0x08 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidFlags);
        }

        let (topic, mut pos) = read_string(body)?;
        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet identifier is zero"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };
        pos += self.skip_properties(&body[pos..])?;

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_ack(&self, body: &[u8]) -> Result<Ack, DecodeError> {
        let packet_id = read_u16(body)?;
        let reason_code = match body.get(2) {
            Some(code) if self.is_v5() => {
                if body.len() > 3 {
                    self.skip_properties(&body[3..])?;
                }
                ReasonCode(*code)
            }
            Some(_) => return Err(DecodeError::MalformedPacket("trailing bytes after ack")),
            None => ReasonCode::SUCCESS,
        };
        Ok(Ack {
            packet_id,
            reason_code,
        })
    }

    fn decode_disconnect(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let reason_code = match body.first() {
            Some(code) if self.is_v5() => ReasonCode(*code),
            Some(_) => return Err(DecodeError::MalformedPacket("v3.1.1 DISCONNECT has no body")),
            None => ReasonCode::SUCCESS,
        };
        Ok(Packet::Disconnect(Disconnect { reason_code }))
    }
}

/// Session expiry from a CONNECT property section, if it is the first property
///
/// Other properties are not interpreted.
fn session_expiry(properties: &[u8]) -> Option<u32> {
    let (_, used) = read_variable_int(properties).ok()?;
    match properties.get(used..used + 5)? {
        [PROPERTY_SESSION_EXPIRY_INTERVAL, b0, b1, b2, b3] => {
            Some(u32::from_be_bytes([*b0, *b1, *b2, *b3]))
        }
        _ => None,
    }
}

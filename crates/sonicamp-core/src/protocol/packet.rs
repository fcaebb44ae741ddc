//! Packet encoding/decoding
//!
//! Implements the text framing used between host and sonicamp.
//!
//! Framed packet format:
//! - `<` start symbol
//! - `DEST#SRC#ID#LEN#` header, all ASCII decimal
//! - `LEN` bytes of UTF-8 payload
//! - `>` end symbol (the host appends `\n` when writing)
//!
//! The legacy protocol has no framing at all: every payload is a single
//! newline-terminated line.

use std::sync::OnceLock;

use bytes::{Buf, BufMut, BytesMut};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::{ProtocolError, MAX_PAYLOAD_SIZE};

/// Start symbol of a framed packet
pub const START_SYMBOL: u8 = b'<';
/// End symbol of a framed packet
pub const END_SYMBOL: u8 = b'>';
/// End symbol of a legacy line
pub const LEGACY_END_SYMBOL: u8 = b'\n';

const SEPARATOR: u8 = b'#';
/// Longest header we accept before deciding the `<` was just noise
const MAX_HEADER_LEN: usize = 32;

/// Which framing the device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameProtocol {
    /// `<dest#src#id#len#payload>` packets with request ids
    #[default]
    Framed,
    /// Bare newline-terminated lines, no ids
    Legacy,
}

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Destination address
    pub destination: u16,
    /// Source address
    pub source: u16,
    /// Request id correlating a request with its answer
    pub id: u16,
    /// Packet payload
    pub payload: String,
}

impl Packet {
    /// Create a host-to-device packet
    pub fn new(id: u16, payload: impl Into<String>) -> Self {
        Self {
            destination: 0,
            source: 0,
            id,
            payload: payload.into(),
        }
    }

    /// Encode the packet as it goes on the wire, including the trailing newline
    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(format!(
            "<{}#{}#{}#{}#{}>\n",
            self.destination,
            self.source,
            self.id,
            self.payload.len(),
            self.payload
        ))
    }

    /// Decode a complete packet string.
    ///
    /// Leading and trailing whitespace is tolerated, anything else that does
    /// not look like a packet is an error.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        static PACKET_RE: OnceLock<Regex> = OnceLock::new();
        let re = PACKET_RE.get_or_init(|| {
            Regex::new(r"(?s)^\s*<(\d+)#(\d+)#(\d+)#(\d+)#(.*)>\s*$").expect("packet pattern is valid")
        });

        let caps = re
            .captures(raw)
            .ok_or_else(|| ProtocolError::MalformedPacket(raw.to_string()))?;
        let number = |i: usize| -> Result<u64, ProtocolError> {
            caps[i]
                .parse::<u64>()
                .map_err(|_| ProtocolError::MalformedPacket(raw.to_string()))
        };

        let destination = to_u16(number(1)?, raw)?;
        let source = to_u16(number(2)?, raw)?;
        let id = to_u16(number(3)?, raw)?;
        let length = number(4)? as usize;
        let payload = caps[5].to_string();

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if payload.len() != length {
            return Err(ProtocolError::MalformedPacket(format!(
                "declared length {} but payload has {} bytes",
                length,
                payload.len()
            )));
        }

        Ok(Self {
            destination,
            source,
            id,
            payload,
        })
    }
}

fn to_u16(value: u64, raw: &str) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::MalformedPacket(raw.to_string()))
}

/// A decoded unit read from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A framed packet
    Packet(Packet),
    /// A legacy line (without its terminator)
    Line(String),
}

/// Stream codec for both framings
#[derive(Debug, Clone, Copy)]
pub struct SonicCodec {
    protocol: FrameProtocol,
}

impl SonicCodec {
    /// Codec for `protocol` framing
    pub fn new(protocol: FrameProtocol) -> Self {
        Self { protocol }
    }

    /// Framing this codec speaks
    pub fn protocol(&self) -> FrameProtocol {
        self.protocol
    }

    fn decode_packet(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(start) = src.iter().position(|&b| b == START_SYMBOL) else {
                if !src.is_empty() {
                    debug!(
                        garbage = %String::from_utf8_lossy(src),
                        "discarding bytes outside of a packet"
                    );
                    src.clear();
                }
                return Ok(None);
            };
            if start > 0 {
                debug!(
                    garbage = %String::from_utf8_lossy(&src[..start]),
                    "discarding bytes before start symbol"
                );
                src.advance(start);
            }

            match parse_header(&src[1..]) {
                HeaderScan::Incomplete => return Ok(None),
                HeaderScan::NotAHeader => {
                    // A stray '<' in printf output; skip it and look for the next one
                    src.advance(1);
                    continue;
                }
                HeaderScan::Header {
                    destination,
                    source,
                    id,
                    length,
                    header_len,
                } => {
                    if length > MAX_PAYLOAD_SIZE {
                        return Err(ProtocolError::BufferOverflow {
                            size: length,
                            max: MAX_PAYLOAD_SIZE,
                        });
                    }
                    let payload_start = 1 + header_len;
                    let end = payload_start + length;
                    if src.len() <= end {
                        src.reserve(end + 1 - src.len());
                        return Ok(None);
                    }
                    if src[end] != END_SYMBOL {
                        return Err(ProtocolError::MalformedPacket(format!(
                            "expected end symbol after {} payload bytes, found {:?}",
                            length, src[end] as char
                        )));
                    }
                    let payload = std::str::from_utf8(&src[payload_start..end])
                        .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))?
                        .to_string();
                    src.advance(end + 1);
                    return Ok(Some(Frame::Packet(Packet {
                        destination,
                        source,
                        id,
                        payload,
                    })));
                }
            }
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(end) = src.iter().position(|&b| b == LEGACY_END_SYMBOL) else {
            if src.len() > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::BufferOverflow {
                    size: src.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            return Ok(None);
        };
        let line = src.split_to(end + 1);
        let text = String::from_utf8_lossy(&line[..end]);
        Ok(Some(Frame::Line(text.trim_end_matches('\r').to_string())))
    }
}

enum HeaderScan {
    Incomplete,
    NotAHeader,
    Header {
        destination: u16,
        source: u16,
        id: u16,
        length: usize,
        header_len: usize,
    },
}

/// Scan `DEST#SRC#ID#LEN#` at the start of `bytes`
fn parse_header(bytes: &[u8]) -> HeaderScan {
    let mut fields = [0u64; 4];
    let mut field = 0;
    let mut digits = 0;

    for (i, &b) in bytes.iter().enumerate() {
        if i > MAX_HEADER_LEN {
            return HeaderScan::NotAHeader;
        }
        match b {
            b'0'..=b'9' => {
                fields[field] = fields[field] * 10 + u64::from(b - b'0');
                digits += 1;
                if digits > 10 {
                    return HeaderScan::NotAHeader;
                }
            }
            SEPARATOR if digits > 0 => {
                field += 1;
                digits = 0;
                if field == fields.len() {
                    let (Ok(destination), Ok(source), Ok(id)) = (
                        u16::try_from(fields[0]),
                        u16::try_from(fields[1]),
                        u16::try_from(fields[2]),
                    ) else {
                        return HeaderScan::NotAHeader;
                    };
                    return HeaderScan::Header {
                        destination,
                        source,
                        id,
                        length: fields[3] as usize,
                        header_len: i + 1,
                    };
                }
            }
            _ => return HeaderScan::NotAHeader,
        }
    }
    HeaderScan::Incomplete
}

impl Decoder for SonicCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.protocol {
            FrameProtocol::Framed => self.decode_packet(src),
            FrameProtocol::Legacy => self.decode_line(src),
        }
    }
}

impl Encoder<Packet> for SonicCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.protocol {
            FrameProtocol::Framed => {
                let wire = item.to_wire()?;
                dst.reserve(wire.len());
                dst.put_slice(wire.as_bytes());
            }
            FrameProtocol::Legacy => {
                if item.payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::BufferOverflow {
                        size: item.payload.len(),
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                dst.reserve(item.payload.len() + 1);
                dst.put_slice(item.payload.as_bytes());
                dst.put_u8(LEGACY_END_SYMBOL);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut SonicCodec, input: &str) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("decode should succeed") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_request_wire_format() {
        let packet = Packet::new(1, "?g");
        assert_eq!(packet.to_wire().unwrap(), "<0#0#1#2#?g>\n");
    }

    #[test]
    fn test_parse_tolerates_trailing_newline() {
        let packet = Packet::parse("<0#0#1#7#gain=42>\n").unwrap();
        assert_eq!(packet.id, 1);
        assert_eq!(packet.payload, "gain=42");
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        assert!(Packet::parse("<0#0#1#3#gain=42>").is_err());
        assert!(Packet::parse("gain=42").is_err());
    }

    #[test]
    fn test_payload_limit() {
        let packet = Packet::new(3, "x".repeat(MAX_PAYLOAD_SIZE + 1));
        assert!(matches!(
            packet.to_wire(),
            Err(ProtocolError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_decoder_skips_garbage() {
        let mut codec = SonicCodec::new(FrameProtocol::Framed);
        let frames = decode_all(&mut codec, "boot ok\r\nx < y<0#0#5#4#ping>");
        assert_eq!(
            frames,
            vec![Frame::Packet(Packet {
                destination: 0,
                source: 0,
                id: 5,
                payload: "ping".to_string()
            })]
        );
    }

    #[test]
    fn test_decoder_payload_may_contain_end_symbol() {
        let mut codec = SonicCodec::new(FrameProtocol::Framed);
        let frames = decode_all(&mut codec, "<0#0#9#5#a>b>c><0#0#10#1#d>");
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Packet(p) => assert_eq!(p.payload, "a>b>c"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decoder_waits_for_partial_packet() {
        let mut codec = SonicCodec::new(FrameProtocol::Framed);
        let mut buf = BytesMut::from("<0#0#2#8#freq=");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"100>");
        let frame = codec.decode(&mut buf).unwrap();
        assert!(matches!(frame, Some(Frame::Packet(p)) if p.payload == "freq=100"));
    }

    #[test]
    fn test_decoder_fails_loudly_on_bad_end_symbol() {
        let mut codec = SonicCodec::new(FrameProtocol::Framed);
        let mut buf = BytesMut::from("<0#0#2#2#abc>");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_legacy_lines() {
        let mut codec = SonicCodec::new(FrameProtocol::Legacy);
        let frames = decode_all(&mut codec, "ver 0.4.0\r\nsoniccatch\npartial");
        assert_eq!(
            frames,
            vec![
                Frame::Line("ver 0.4.0".to_string()),
                Frame::Line("soniccatch".to_string())
            ]
        );
    }

    #[test]
    fn test_legacy_encoder_is_identity_plus_newline() {
        let mut codec = SonicCodec::new(FrameProtocol::Legacy);
        let mut dst = BytesMut::new();
        codec.encode(Packet::new(7, "!ON"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"!ON\n");
    }
}

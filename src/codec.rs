use std::net::SocketAddr;

use bytes::Bytes;
use coap_lite::{MessageClass, Packet};
use thiserror::Error;

use crate::message::{EmptyMessage, Request, Response};
use crate::EndpointError;

/// A successfully parsed inbound message, classified by code class.
pub(crate) enum ParsedMessage {
    Request(Request),
    Response(Response),
    Empty(EmptyMessage),
    /// Parsed, but the code is neither request, response nor empty.
    Ignored,
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The message could not be decoded. When the fixed header was readable
    /// the MID is recoverable, and `confirmable` tells whether the sender
    /// expects an RST (RFC 7252 Section 4.2).
    #[error("malformed message")]
    Malformed { confirmable: bool, mid: Option<u16> },
    /// The buffer holds only part of a frame (stream transports).
    #[error("incomplete frame")]
    Incomplete,
}

/// Wire codec variant, selected from the connector's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Codec {
    /// RFC 7252 datagram framing.
    Udp,
    /// RFC 8323 stream framing: Len|TKL, extended length, code, token.
    Tcp,
}

impl Codec {
    pub(crate) fn parse(&self, bytes: &[u8], source: SocketAddr) -> Result<ParsedMessage, ParseError> {
        let packet = match self {
            Codec::Udp => parse_udp(bytes)?,
            Codec::Tcp => parse_tcp(bytes)?,
        };
        Ok(classify(packet, source))
    }

    pub(crate) fn serialize(&self, packet: &Packet) -> Result<Bytes, EndpointError> {
        let datagram = packet.to_bytes()?;
        match self {
            Codec::Udp => Ok(Bytes::from(datagram)),
            Codec::Tcp => Ok(Bytes::from(reframe_tcp(&datagram))),
        }
    }
}

fn classify(packet: Packet, source: SocketAddr) -> ParsedMessage {
    match packet.header.code {
        MessageClass::Request(_) => ParsedMessage::Request(Request::from_packet(packet, source)),
        MessageClass::Response(_) => ParsedMessage::Response(Response::from_packet(packet, source)),
        MessageClass::Empty => ParsedMessage::Empty(EmptyMessage::from_packet(packet, source)),
        MessageClass::Reserved(_) => ParsedMessage::Ignored,
    }
}

fn parse_udp(bytes: &[u8]) -> Result<Packet, ParseError> {
    Packet::from_bytes(bytes).map_err(|_| {
        // Probe the fixed header so a confirmable message with a readable
        // MID can still be rejected with an RST.
        if bytes.len() >= 4 && bytes[0] >> 6 == 1 {
            let message_type = (bytes[0] >> 4) & 0b11;
            let mid = u16::from_be_bytes([bytes[2], bytes[3]]);
            ParseError::Malformed {
                confirmable: message_type == 0,
                mid: Some(mid),
            }
        } else {
            ParseError::Malformed {
                confirmable: false,
                mid: None,
            }
        }
    })
}

/// Converts an RFC 7252 serialization into an RFC 8323 frame. Token,
/// options and payload share the same layout in both formats; only the
/// fixed header differs.
fn reframe_tcp(datagram: &[u8]) -> Vec<u8> {
    let tkl = (datagram[0] & 0x0F) as usize;
    let code = datagram[1];
    let token = &datagram[4..4 + tkl];
    let rest = &datagram[4 + tkl..];
    let len = rest.len();

    let mut frame = Vec::with_capacity(len + tkl + 6);
    match len {
        0..=12 => frame.push(((len as u8) << 4) | tkl as u8),
        13..=268 => {
            frame.push((13 << 4) | tkl as u8);
            frame.push((len - 13) as u8);
        }
        269..=65804 => {
            frame.push((14 << 4) | tkl as u8);
            frame.extend_from_slice(&((len - 269) as u16).to_be_bytes());
        }
        _ => {
            frame.push((15 << 4) | tkl as u8);
            frame.extend_from_slice(&((len - 65805) as u32).to_be_bytes());
        }
    }
    frame.push(code);
    frame.extend_from_slice(token);
    frame.extend_from_slice(rest);
    frame
}

fn parse_tcp(frame: &[u8]) -> Result<Packet, ParseError> {
    let (header_len, message_len, tkl) = tcp_frame_header(frame).ok_or(ParseError::Incomplete)?;
    let total = header_len + tkl + message_len;
    if frame.len() < total {
        return Err(ParseError::Incomplete);
    }
    if frame.len() > total {
        return Err(ParseError::Malformed {
            confirmable: false,
            mid: None,
        });
    }

    let code = frame[header_len - 1];
    let token = &frame[header_len..header_len + tkl];
    let rest = &frame[header_len + tkl..];

    // Rebuild an RFC 7252 buffer; type and MID do not exist on stream
    // transports, so the packet gets NON and MID 0.
    let mut datagram = Vec::with_capacity(4 + tkl + rest.len());
    datagram.push(0x50 | tkl as u8);
    datagram.push(code);
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(token);
    datagram.extend_from_slice(rest);

    Packet::from_bytes(&datagram).map_err(|_| ParseError::Malformed {
        confirmable: false,
        mid: None,
    })
}

/// Reads the Len|TKL byte and extended length of an RFC 8323 frame.
/// Returns (bytes up to and including the code, message length, token
/// length), or `None` if the header is still incomplete.
fn tcp_frame_header(buf: &[u8]) -> Option<(usize, usize, usize)> {
    let first = *buf.first()?;
    let len_nibble = (first >> 4) as usize;
    let tkl = (first & 0x0F) as usize;
    let (ext_len, base) = match len_nibble {
        0..=12 => (0usize, len_nibble),
        13 => (1, 13),
        14 => (2, 269),
        _ => (4, 65805),
    };
    if buf.len() < 1 + ext_len + 1 {
        return None;
    }
    let ext = buf[1..1 + ext_len]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    let message_len = if ext_len == 0 { base } else { base + ext };
    Some((1 + ext_len + 1, message_len, tkl))
}

/// Length of the complete RFC 8323 frame at the start of `buf`, if the
/// buffer already holds one. Stream connectors use this to cut frames out
/// of the byte stream.
pub fn tcp_frame_length(buf: &[u8]) -> Option<usize> {
    let (header_len, message_len, tkl) = tcp_frame_header(buf)?;
    let total = header_len + tkl + message_len;
    (buf.len() >= total).then_some(total)
}

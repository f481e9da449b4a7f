//! WebSocket server framing (RFC 6455 subset).
//!
//! Covers exactly what a streaming server needs: the HTTP/1.1 upgrade
//! handshake (§4.2), a frame parser that handles masked client frames
//! with 7/16/64-bit lengths (§5.2), and unmasked server frame encoding.
//! No extensions, no continuation frames.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key when computing the accept hash
/// (RFC 6455 §1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket frame opcodes (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }
}

/// A parsed WebSocket frame, payload already unmasked.
#[derive(Debug, Clone)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Whether a buffer starts like an HTTP request (`GET `).
pub fn is_http_request(data: &[u8]) -> bool {
    data.len() >= 4 && &data[..4] == b"GET "
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Run the server side of the upgrade handshake.
///
/// Locates the `Sec-WebSocket-Key:` header (the exact capitalization
/// browsers send) and returns the 101 response, or `None` when the key
/// header is missing.
pub fn handshake_response(request: &str) -> Option<String> {
    const KEY_HEADER: &str = "Sec-WebSocket-Key:";

    let key_pos = request.find(KEY_HEADER)? + KEY_HEADER.len();
    let rest = &request[key_pos..];
    let line_end = rest.find("\r\n")?;
    let key = rest[..line_end].trim();

    Some(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    ))
}

/// Parse one frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame (nothing is consumed).
/// Client frames are masked per RFC 6455 §5.3; the payload is unmasked
/// here.
pub fn parse_frame(data: &[u8]) -> Option<(WsFrame, usize)> {
    if data.len() < 2 {
        return None;
    }

    let fin = data[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(data[0] & 0x0F)?;
    let masked = data[1] & 0x80 != 0;

    let mut offset = 2usize;
    let mut payload_len = u64::from(data[1] & 0x7F);

    if payload_len == 126 {
        if data.len() < 4 {
            return None;
        }
        payload_len = u64::from(u16::from_be_bytes([data[2], data[3]]));
        offset = 4;
    } else if payload_len == 127 {
        if data.len() < 10 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[2..10]);
        payload_len = u64::from_be_bytes(bytes);
        offset = 10;
    }

    let mut mask_key = [0u8; 4];
    if masked {
        if data.len() < offset + 4 {
            return None;
        }
        mask_key.copy_from_slice(&data[offset..offset + 4]);
        offset += 4;
    }

    let payload_len = usize::try_from(payload_len).ok()?;
    if data.len() < offset + payload_len {
        return None;
    }

    let mut payload = data[offset..offset + payload_len].to_vec();
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i % 4];
        }
    }

    Some((
        WsFrame {
            fin,
            opcode,
            payload,
        },
        offset + payload_len,
    ))
}

/// Encode a server frame: FIN set, never masked (RFC 6455 §5.1).
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | opcode as u8);

    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= 0xFFFF {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Encode a close frame with a status code and UTF-8 reason (§5.5.1).
pub fn close_frame(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(Opcode::Close, &payload)
}

/// Encode a pong echoing the ping's payload (§5.5.3).
pub fn pong_frame(ping_payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Pong, ping_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_example_accept_key() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_response_contains_accept() {
        let request = "GET /stream HTTP/1.1\r\n\
                       Host: localhost:6061\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        let response = handshake_response(request).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn handshake_missing_key_fails() {
        let request = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(handshake_response(request).is_none());
    }

    #[test]
    fn is_http_request_checks_method() {
        assert!(is_http_request(b"GET / HTTP/1.1\r\n"));
        assert!(!is_http_request(b"POST / HTTP/1.1\r\n"));
        assert!(!is_http_request(b"GE"));
    }

    fn masked_client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mask = [0x12u8, 0x34, 0x56, 0x78];
        let mut frame = vec![0x80 | opcode as u8];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 0xFFFF {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % 4]),
        );
        frame
    }

    #[test]
    fn parse_masked_text_frame() {
        let raw = masked_client_frame(Opcode::Text, b"hello");
        let (frame, consumed) = parse_frame(&raw).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parse_extended_16bit_length() {
        let payload = vec![0xABu8; 300];
        let raw = masked_client_frame(Opcode::Binary, &payload);
        let (frame, consumed) = parse_frame(&raw).unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parse_extended_64bit_length() {
        let payload = vec![0x42u8; 70_000];
        let raw = masked_client_frame(Opcode::Binary, &payload);
        let (frame, _) = parse_frame(&raw).unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn parse_incomplete_returns_none() {
        let raw = masked_client_frame(Opcode::Binary, &[1, 2, 3, 4, 5]);
        for cut in 0..raw.len() {
            assert!(parse_frame(&raw[..cut]).is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn parse_two_frames_consumes_one() {
        let first = masked_client_frame(Opcode::Text, b"one");
        let second = masked_client_frame(Opcode::Text, b"two");
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let (frame, consumed) = parse_frame(&buf).unwrap();
        assert_eq!(frame.payload, b"one");
        assert_eq!(consumed, first.len());

        let (frame, _) = parse_frame(&buf[consumed..]).unwrap();
        assert_eq!(frame.payload, b"two");
    }

    #[test]
    fn encode_small_frame_unmasked() {
        let frame = encode_frame(Opcode::Binary, &[1, 2, 3]);
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1], 3); // no mask bit
        assert_eq!(&frame[2..], &[1, 2, 3]);
    }

    #[test]
    fn encode_16bit_length() {
        let frame = encode_frame(Opcode::Binary, &[0u8; 300]);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
    }

    #[test]
    fn encode_64bit_length() {
        let frame = encode_frame(Opcode::Binary, &[0u8; 70_000]);
        assert_eq!(frame[1], 127);
        assert_eq!(
            u64::from_be_bytes(frame[2..10].try_into().unwrap()),
            70_000
        );
    }

    #[test]
    fn close_frame_code_and_reason() {
        let frame = close_frame(1008, "Negotiation timeout");
        assert_eq!(frame[0], 0x88);
        // payload: 2-byte code 0x03F0 + reason text
        assert_eq!(&frame[2..4], &[0x03, 0xF0]);
        assert_eq!(&frame[4..], b"Negotiation timeout");
    }

    #[test]
    fn pong_echoes_ping_payload() {
        let frame = pong_frame(b"ka");
        assert_eq!(frame[0], 0x8A);
        assert_eq!(&frame[2..], b"ka");
    }

    #[test]
    fn server_roundtrip_through_parser() {
        let encoded = encode_frame(Opcode::Text, b"{\"x\":1}");
        let (frame, consumed) = parse_frame(&encoded).unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"{\"x\":1}");
        assert_eq!(consumed, encoded.len());
    }
}

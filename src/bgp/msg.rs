// Copyright 2025 bgprobe Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::io::AsyncReadExt;

pub const BGP_HEADER_SIZE_BYTES: usize = 19;
pub const MAX_MESSAGE_SIZE: u16 = 4096;

// BGP header marker (16 bytes of 0xFF)
pub const BGP_MARKER: [u8; 16] = [0xff; 16];

/// Message type tag from header byte 18. Unknown values classify as
/// `Unrecognized` rather than erroring; the probe must keep talking to
/// implementations that send types it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open,
    Update,
    Notification,
    Keepalive,
    Unrecognized(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageType::Open,
            2 => MessageType::Update,
            3 => MessageType::Notification,
            4 => MessageType::Keepalive,
            val => MessageType::Unrecognized(val),
        }
    }
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Open => 1,
            MessageType::Update => 2,
            MessageType::Notification => 3,
            MessageType::Keepalive => 4,
            MessageType::Unrecognized(val) => val,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Open => write!(f, "OPEN"),
            MessageType::Update => write!(f, "UPDATE"),
            MessageType::Notification => write!(f, "NOTIFICATION"),
            MessageType::Keepalive => write!(f, "KEEPALIVE"),
            MessageType::Unrecognized(val) => write!(f, "UNKNOWN({})", val),
        }
    }
}

/// Trait for BGP message types that can serialize themselves
pub trait Message {
    /// Returns the message type identifier
    fn kind(&self) -> MessageType;

    /// Serializes the message body (without BGP header)
    fn to_bytes(&self) -> Vec<u8>;

    /// Serializes the complete BGP message with header
    fn serialize(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut message = Vec::new();

        message.extend_from_slice(&BGP_MARKER);

        let length = BGP_HEADER_SIZE_BYTES as u16 + body.len() as u16;
        message.extend_from_slice(&length.to_be_bytes());

        message.push(self.kind().as_u8());
        message.extend_from_slice(&body);

        message
    }
}

/// One raw frame off the wire: the 19-byte header plus the body it
/// declared. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: [u8; BGP_HEADER_SIZE_BYTES],
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.header[16], self.header[17]])
    }

    pub fn msg_type(&self) -> MessageType {
        MessageType::from(self.header[18])
    }

    /// Complete frame bytes, header included. Used by echo mode.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header.to_vec();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Lowercase hex dump of header+body, no separators. This is the
    /// event currency in raw comparison mode.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(2 * (self.header.len() + self.body.len()));
        for byte in self.header.iter().chain(self.body.iter()) {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    /// Length field outside [19, 4096]
    BadLength(u16),
    Io(String),
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadLength(len) => write!(f, "invalid message length {}", len),
            FrameError::Io(s) => write!(f, "IO error: {}", s),
        }
    }
}

impl Error for FrameError {}

/// Read one complete frame (19-byte header + declared body).
///
/// Returns `Ok(None)` when the peer closed the connection, including a
/// close landing in the middle of a frame. The marker bytes are not
/// validated; implementations under test send arbitrary markers.
/// Would-block conditions are retried by the runtime's readiness
/// notifications, so the reader makes progress whenever data arrives
/// without busy-spinning.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    mut stream: R,
) -> Result<Option<RawMessage>, FrameError> {
    let mut header = [0u8; BGP_HEADER_SIZE_BYTES];

    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(FrameError::Io(err.to_string())),
    }

    let total_length = u16::from_be_bytes([header[16], header[17]]);
    if total_length < BGP_HEADER_SIZE_BYTES as u16 || total_length > MAX_MESSAGE_SIZE {
        return Err(FrameError::BadLength(total_length));
    }

    let body_length = total_length as usize - BGP_HEADER_SIZE_BYTES;
    let mut body = vec![0u8; body_length];
    if body_length > 0 {
        match stream.read_exact(&mut body).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(FrameError::Io(err.to_string())),
        }
    }

    Ok(Some(RawMessage { header, body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MOCK_KEEPALIVE: &[u8] = &[
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x00, 0x13, // Message length (19 bytes)
        0x04, // Message type (Keepalive)
    ];

    #[test]
    fn test_message_type_total() {
        assert_eq!(MessageType::from(1), MessageType::Open);
        assert_eq!(MessageType::from(2), MessageType::Update);
        assert_eq!(MessageType::from(3), MessageType::Notification);
        assert_eq!(MessageType::from(4), MessageType::Keepalive);
        assert_eq!(MessageType::from(99), MessageType::Unrecognized(99));
        assert_eq!(MessageType::from(99).as_u8(), 99);
    }

    #[tokio::test]
    async fn test_read_frame_keepalive() {
        let stream = Cursor::new(MOCK_KEEPALIVE);
        let msg = read_frame(stream).await.unwrap().unwrap();
        assert_eq!(msg.total_length(), 19);
        assert_eq!(msg.msg_type(), MessageType::Keepalive);
        assert!(msg.body.is_empty());
        assert_eq!(msg.to_bytes(), MOCK_KEEPALIVE);
    }

    #[tokio::test]
    async fn test_read_frame_with_body() {
        let mut frame = MOCK_KEEPALIVE.to_vec();
        frame[17] = 0x16; // 22 bytes total, 3 body bytes
        frame[18] = 0x02;
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        let msg = read_frame(Cursor::new(frame)).await.unwrap().unwrap();
        assert_eq!(msg.msg_type(), MessageType::Update);
        assert_eq!(msg.body, vec![0xaa, 0xbb, 0xcc]);
    }

    #[tokio::test]
    async fn test_read_frame_tolerates_arbitrary_marker() {
        let mut frame = MOCK_KEEPALIVE.to_vec();
        frame[0] = 0x00;
        frame[15] = 0x42;
        let msg = read_frame(Cursor::new(frame)).await.unwrap().unwrap();
        assert_eq!(msg.msg_type(), MessageType::Keepalive);
    }

    #[tokio::test]
    async fn test_read_frame_empty_stream_is_close() {
        let stream = Cursor::new(Vec::<u8>::new());
        assert_eq!(read_frame(stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_partial_header_is_close() {
        let stream = Cursor::new(&MOCK_KEEPALIVE[..7]);
        assert_eq!(read_frame(stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body_is_close() {
        let mut frame = MOCK_KEEPALIVE.to_vec();
        frame[17] = 0x20; // claims 32 bytes but stream ends after header
        assert_eq!(read_frame(Cursor::new(frame)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_length_too_small() {
        let mut frame = MOCK_KEEPALIVE.to_vec();
        frame[16] = 0x00;
        frame[17] = 0x12; // 18
        match read_frame(Cursor::new(frame)).await {
            Err(FrameError::BadLength(18)) => {}
            other => panic!("expected BadLength(18), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_length_too_large() {
        let mut frame = MOCK_KEEPALIVE.to_vec();
        frame[16] = 0x10;
        frame[17] = 0x01; // 4097
        match read_frame(Cursor::new(frame)).await {
            Err(FrameError::BadLength(4097)) => {}
            other => panic!("expected BadLength(4097), got {:?}", other),
        }
    }

    #[test]
    fn test_raw_message_hex() {
        let msg = RawMessage {
            header: MOCK_KEEPALIVE.try_into().unwrap(),
            body: vec![0x01, 0xab],
        };
        let hex = msg.to_hex();
        assert!(hex.starts_with("ffffffff"));
        assert!(hex.ends_with("001301ab"));
        assert_eq!(hex.len(), 2 * (19 + 2));
    }
}

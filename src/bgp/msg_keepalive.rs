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

use super::msg::{Message, MessageType};

/// KEEPALIVE has no body. The probe sends one as the handshake
/// confirmation and one per processed event as an acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct KeepaliveMessage {}

impl Message for KeepaliveMessage {
    fn kind(&self) -> MessageType {
        MessageType::Keepalive
    }

    fn to_bytes(&self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg::BGP_MARKER;

    #[test]
    fn test_keepalive_serialize() {
        let frame = KeepaliveMessage::default().serialize();
        assert_eq!(frame.len(), 19);
        assert_eq!(&frame[..16], &BGP_MARKER);
        assert_eq!(&frame[16..18], &[0x00, 0x13]);
        assert_eq!(frame[18], 4);
    }
}

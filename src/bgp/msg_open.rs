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
use super::DecodeError;

// Optional parameter type 2 = capabilities (RFC 3392)
const PARAM_TYPE_CAPABILITIES: u8 = 2;

/// Capability code deliberately outside every assigned range the peer
/// under test could know. A conformant peer must skip it.
pub const UNKNOWN_CAPABILITY_CODE: u8 = 66;

/// Peer OPEN, parsed just far enough to build the echo reply. The
/// optional parameters stay opaque bytes: the probe echoes the peer's
/// capabilities, it does not negotiate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_identifier: u32,
    pub optional_params: Vec<u8>,
}

impl OpenMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 10 {
            return Err(DecodeError::Truncated { what: "OPEN body" });
        }

        let version = bytes[0];
        let asn = u16::from_be_bytes([bytes[1], bytes[2]]);
        let hold_time = u16::from_be_bytes([bytes[3], bytes[4]]);
        let bgp_identifier = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let optional_params_len = bytes[9] as usize;

        if bytes.len() < 10 + optional_params_len {
            return Err(DecodeError::Truncated {
                what: "OPEN optional parameters",
            });
        }

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            bgp_identifier,
            optional_params: bytes[10..10 + optional_params_len].to_vec(),
        })
    }

    /// Build the reply the probe sends back: the peer's own OPEN with
    /// the router-id low octet incremented (so the two ends never claim
    /// the same identifier), optionally with a synthetic unknown
    /// capability spliced into the parameters.
    pub fn echo_reply(&self, inject_unknown_capability: bool) -> OpenMessage {
        let low = (self.bgp_identifier & 0xff) as u8;
        let bgp_identifier = (self.bgp_identifier & 0xffff_ff00) | low.wrapping_add(1) as u32;

        let mut optional_params = self.optional_params.clone();
        if inject_unknown_capability {
            // param type, param length, capability code, capability
            // length, two value bytes
            optional_params.extend_from_slice(&[
                PARAM_TYPE_CAPABILITIES,
                4,
                UNKNOWN_CAPABILITY_CODE,
                2,
                0x00,
                0x00,
            ]);
        }

        OpenMessage {
            version: self.version,
            asn: self.asn,
            hold_time: self.hold_time,
            bgp_identifier,
            optional_params,
        }
    }

    pub fn router_id_text(&self) -> String {
        std::net::Ipv4Addr::from(self.bgp_identifier).to_string()
    }
}

impl Message for OpenMessage {
    fn kind(&self) -> MessageType {
        MessageType::Open
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(10 + self.optional_params.len());
        bytes.push(self.version);
        bytes.extend_from_slice(&self.asn.to_be_bytes());
        bytes.extend_from_slice(&self.hold_time.to_be_bytes());
        bytes.extend_from_slice(&self.bgp_identifier.to_be_bytes());
        bytes.push(self.optional_params.len() as u8);
        bytes.extend_from_slice(&self.optional_params);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // version 4, ASN 1234, hold time 10, identifier 10.10.10.10, one
    // multiprotocol capability parameter
    const MOCK_OPEN_BODY: &[u8] = &[
        0x04, 0x04, 0xd2, 0x00, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x08, 0x02, 0x06, 0x01, 0x04, 0x00,
        0x01, 0x00, 0x01,
    ];

    #[test]
    fn test_open_from_bytes() {
        let open = OpenMessage::from_bytes(MOCK_OPEN_BODY).unwrap();
        assert_eq!(open.version, 4);
        assert_eq!(open.asn, 1234);
        assert_eq!(open.hold_time, 10);
        assert_eq!(open.bgp_identifier, 0x0a0a0a0a);
        assert_eq!(open.optional_params.len(), 8);
        assert_eq!(open.router_id_text(), "10.10.10.10");
    }

    #[test]
    fn test_open_from_bytes_truncated() {
        assert_eq!(
            OpenMessage::from_bytes(&MOCK_OPEN_BODY[..9]),
            Err(DecodeError::Truncated { what: "OPEN body" })
        );

        // declares 8 parameter bytes but carries 4
        assert_eq!(
            OpenMessage::from_bytes(&MOCK_OPEN_BODY[..14]),
            Err(DecodeError::Truncated {
                what: "OPEN optional parameters"
            })
        );
    }

    #[test]
    fn test_open_roundtrip() {
        let open = OpenMessage::from_bytes(MOCK_OPEN_BODY).unwrap();
        assert_eq!(open.to_bytes(), MOCK_OPEN_BODY);
    }

    #[test]
    fn test_echo_reply_bumps_router_id() {
        let open = OpenMessage::from_bytes(MOCK_OPEN_BODY).unwrap();
        let reply = open.echo_reply(false);
        assert_eq!(reply.bgp_identifier, 0x0a0a0a0b);
        assert_eq!(reply.asn, open.asn);
        assert_eq!(reply.hold_time, open.hold_time);
        assert_eq!(reply.optional_params, open.optional_params);
    }

    #[test]
    fn test_echo_reply_router_id_wraps() {
        let mut open = OpenMessage::from_bytes(MOCK_OPEN_BODY).unwrap();
        open.bgp_identifier = 0x0a0a0aff;
        assert_eq!(open.echo_reply(false).bgp_identifier, 0x0a0a0a00);
    }

    #[test]
    fn test_echo_reply_injects_unknown_capability() {
        let open = OpenMessage::from_bytes(MOCK_OPEN_BODY).unwrap();
        let reply = open.echo_reply(true);

        assert_eq!(reply.optional_params.len(), open.optional_params.len() + 6);
        let injected = &reply.optional_params[open.optional_params.len()..];
        assert_eq!(injected, &[2, 4, UNKNOWN_CAPABILITY_CODE, 2, 0, 0]);

        // the declared parameter length and total length must cover the splice
        let body = reply.to_bytes();
        assert_eq!(body[9] as usize, reply.optional_params.len());
        assert_eq!(body.len(), 10 + reply.optional_params.len());
    }
}

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
use crate::net::Ipv4Net;
use std::net::Ipv4Addr;

const WITHDRAWN_ROUTES_LENGTH_SIZE: usize = 2;
const TOTAL_ATTR_LENGTH_SIZE: usize = 2;

mod attr_flags {
    pub const TRANSITIVE: u8 = 1 << 6;
}

mod attr_type_code {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
}

const ORIGIN_IGP: u8 = 0;

/// One decoded route event from an UPDATE body. Produced fresh per
/// message, never persisted; the `Display` form is the event string the
/// expectation engine matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    Announce(Ipv4Net),
    Withdraw(Ipv4Net),
    EndOfRib { afi: u16, safi: u8 },
    /// Multiprotocol NLRI carried in path attributes; not decoded
    Unparsed,
}

impl std::fmt::Display for RouteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteEvent::Announce(net) => write!(f, "announce:{}", net),
            RouteEvent::Withdraw(net) => write!(f, "withdraw:{}", net),
            RouteEvent::EndOfRib { afi, safi } => write!(f, "eor:{}:{}", afi, safi),
            RouteEvent::Unparsed => write!(f, "mp:"),
        }
    }
}

/// Number of address octets carried on the wire for a CIDR length.
fn prefix_octets(prefix_length: u8) -> usize {
    match prefix_length {
        len if len > 24 => 4,
        len if len > 16 => 3,
        len if len > 8 => 2,
        len if len > 0 => 1,
        _ => 0,
    }
}

fn read_u16(bytes: &[u8], offset: usize, what: &'static str) -> Result<u16, DecodeError> {
    if offset + 2 > bytes.len() {
        return Err(DecodeError::Truncated { what });
    }
    Ok(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]))
}

/// Walk one NLRI block: a CIDR length octet followed by just enough
/// address octets, repeated until the block is exhausted. Remaining
/// address octets are zero-filled. Bounds are checked before every read.
fn read_prefixes(block: &[u8]) -> Result<Vec<Ipv4Net>, DecodeError> {
    let mut cursor = 0;
    let mut prefixes = Vec::new();

    while cursor < block.len() {
        let prefix_length = block[cursor];
        cursor += 1;

        if prefix_length > 32 {
            return Err(DecodeError::PrefixLength(prefix_length));
        }

        let octet_count = prefix_octets(prefix_length);
        if cursor + octet_count > block.len() {
            return Err(DecodeError::PrefixOverrun {
                declared: prefix_length,
                available: block.len() - cursor,
            });
        }

        let mut ip_buffer = [0u8; 4];
        ip_buffer[..octet_count].copy_from_slice(&block[cursor..cursor + octet_count]);
        cursor += octet_count;

        prefixes.push(Ipv4Net {
            address: Ipv4Addr::from(ip_buffer),
            prefix_length,
        });
    }

    Ok(prefixes)
}

/// Decode an UPDATE body into its route events.
///
/// An UPDATE with neither withdrawn nor announced NLRI is an end-of-RIB
/// marker: the 4-byte form means IPv4 unicast, the 11-byte MP_UNREACH
/// form carries its AFI/SAFI in the trailing bytes, and anything else is
/// multiprotocol content this probe does not decode.
pub fn decode_route_events(body: &[u8]) -> Result<Vec<RouteEvent>, DecodeError> {
    let withdrawn_len = read_u16(body, 0, "withdrawn routes length")? as usize;
    let withdrawn_end = WITHDRAWN_ROUTES_LENGTH_SIZE + withdrawn_len;
    if withdrawn_end > body.len() {
        return Err(DecodeError::Truncated {
            what: "withdrawn routes",
        });
    }
    let withdrawn = &body[WITHDRAWN_ROUTES_LENGTH_SIZE..withdrawn_end];

    let attr_len = read_u16(body, withdrawn_end, "path attributes length")? as usize;
    let attrs_end = withdrawn_end + TOTAL_ATTR_LENGTH_SIZE + attr_len;
    if attrs_end > body.len() {
        return Err(DecodeError::Truncated {
            what: "path attributes",
        });
    }
    let announced = &body[attrs_end..];

    if withdrawn.is_empty() && announced.is_empty() {
        let event = match body.len() {
            4 => RouteEvent::EndOfRib { afi: 1, safi: 1 },
            11 => RouteEvent::EndOfRib {
                afi: u16::from_be_bytes([body[body.len() - 3], body[body.len() - 2]]),
                safi: body[body.len() - 1],
            },
            _ => RouteEvent::Unparsed,
        };
        return Ok(vec![event]);
    }

    let mut events: Vec<RouteEvent> = read_prefixes(withdrawn)?
        .into_iter()
        .map(RouteEvent::Withdraw)
        .collect();
    events.extend(
        read_prefixes(announced)?
            .into_iter()
            .map(RouteEvent::Announce),
    );

    Ok(events)
}

/// Minimal UPDATE encoder, just enough for the synthetic default-route
/// announcement: the three mandatory attributes and one NLRI.
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub next_hop: Ipv4Addr,
    pub nlri: Vec<Ipv4Net>,
}

impl UpdateMessage {
    pub fn default_route(next_hop: Ipv4Addr) -> Self {
        UpdateMessage {
            next_hop,
            nlri: vec![Ipv4Net {
                address: Ipv4Addr::UNSPECIFIED,
                prefix_length: 0,
            }],
        }
    }
}

fn write_attribute(bytes: &mut Vec<u8>, type_code: u8, value: &[u8]) {
    bytes.push(attr_flags::TRANSITIVE);
    bytes.push(type_code);
    bytes.push(value.len() as u8);
    bytes.extend_from_slice(value);
}

fn write_nlri_list(nlri_list: &[Ipv4Net]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for net in nlri_list {
        bytes.push(net.prefix_length);
        let octets = net.address.octets();
        bytes.extend_from_slice(&octets[..prefix_octets(net.prefix_length)]);
    }
    bytes
}

impl Message for UpdateMessage {
    fn kind(&self) -> MessageType {
        MessageType::Update
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut attrs = Vec::new();
        write_attribute(&mut attrs, attr_type_code::ORIGIN, &[ORIGIN_IGP]);
        write_attribute(&mut attrs, attr_type_code::AS_PATH, &[]);
        write_attribute(&mut attrs, attr_type_code::NEXT_HOP, &self.next_hop.octets());

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u16.to_be_bytes()); // no withdrawn routes
        bytes.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&attrs);
        bytes.extend_from_slice(&write_nlri_list(&self.nlri));
        bytes
    }
}

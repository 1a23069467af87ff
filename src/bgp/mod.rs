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

pub mod msg;
pub mod msg_keepalive;
pub mod msg_notification;
pub mod msg_open;
pub mod msg_update;

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Malformed message bodies surface as decode errors; they must never
/// read out of bounds or panic. The session driver treats a decode
/// failure like an unexpected event.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// A declared length runs past the end of the body
    Truncated { what: &'static str },
    /// CIDR length above 32 in an IPv4 NLRI block
    PrefixLength(u8),
    /// A prefix's address octets run past the end of its block
    PrefixOverrun { declared: u8, available: usize },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated { what } => write!(f, "truncated {}", what),
            DecodeError::PrefixLength(len) => {
                write!(f, "invalid IPv4 prefix length {}", len)
            }
            DecodeError::PrefixOverrun {
                declared,
                available,
            } => write!(
                f,
                "prefix /{} needs more address octets than the {} remaining",
                declared, available
            ),
        }
    }
}

impl Error for DecodeError {}

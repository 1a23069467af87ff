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

use std::io;
use std::net::Ipv4Addr;

/// IPv4 network prefix
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Ipv4Net {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_length)
    }
}

/// Parse CIDR notation string into Ipv4Net
impl std::str::FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 {
            return Err(format!(
                "invalid CIDR format '{}' (expected address/length)",
                s
            ));
        }

        let address = parts[0]
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("invalid IPv4 address '{}'", parts[0]))?;

        let prefix_length = parts[1]
            .parse::<u8>()
            .map_err(|_| format!("invalid prefix length '{}'", parts[1]))?;

        if prefix_length > 32 {
            return Err(format!("IPv4 prefix length {} exceeds 32", prefix_length));
        }

        Ok(Ipv4Net {
            address,
            prefix_length,
        })
    }
}

/// Describe a listener bind failure for the operator. The QA harness greps
/// for the permission/in-use distinction when diagnosing environment
/// problems.
pub fn describe_bind_error(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            "permission denied (binding privileged ports requires elevated rights)".to_string()
        }
        io::ErrorKind::AddrInUse => "address already in use".to_string(),
        _ => err.to_string(),
    }
}

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

// RFC 4271 error code / RFC 4486 subcode used for the scripted shutdown
const ERROR_CODE_CEASE: u8 = 6;
const CEASE_ADMINISTRATIVE_SHUTDOWN: u8 = 2;

/// NOTIFICATION body: error code, subcode, trailing data. Received
/// notifications are decoded only to be logged; the probe sends one
/// synthetic cease in `send-notification` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    /// Decode a received NOTIFICATION body. Short bodies decode with
    /// zeroed fields rather than failing; a malformed notification is
    /// still worth logging.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        NotificationMessage {
            error_code: bytes.first().copied().unwrap_or(0),
            subcode: bytes.get(1).copied().unwrap_or(0),
            data: bytes.get(2..).map(|d| d.to_vec()).unwrap_or_default(),
        }
    }

    /// The fixed cease notification sent before scripted close.
    pub fn scripted_shutdown() -> Self {
        NotificationMessage {
            error_code: ERROR_CODE_CEASE,
            subcode: CEASE_ADMINISTRATIVE_SHUTDOWN,
            data: b"scripted shutdown".to_vec(),
        }
    }

    /// Trailing data rendered for the log, lossy for non-UTF8 payloads.
    pub fn data_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl Message for NotificationMessage {
    fn kind(&self) -> MessageType {
        MessageType::Notification
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.data.len());
        bytes.push(self.error_code);
        bytes.push(self.subcode);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

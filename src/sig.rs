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

use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Delay before a `signal-<NAME>` option fires at the controlling
/// process. Test infrastructure, not a protocol bound.
pub const DELAYED_SIGNAL_SECS: u64 = 2;

/// Name → number mapping built once at startup. Script files address
/// signals by name; the table accepts both `USR1` and `SIGUSR1`
/// spellings.
#[derive(Debug, Clone)]
pub struct SignalTable {
    map: HashMap<&'static str, i32>,
}

impl SignalTable {
    pub fn new() -> Self {
        let map = HashMap::from([
            ("HUP", libc::SIGHUP),
            ("INT", libc::SIGINT),
            ("QUIT", libc::SIGQUIT),
            ("KILL", libc::SIGKILL),
            ("ALRM", libc::SIGALRM),
            ("TERM", libc::SIGTERM),
            ("USR1", libc::SIGUSR1),
            ("USR2", libc::SIGUSR2),
            ("CHLD", libc::SIGCHLD),
            ("CONT", libc::SIGCONT),
            ("STOP", libc::SIGSTOP),
        ]);
        SignalTable { map }
    }

    pub fn lookup(&self, name: &str) -> Option<i32> {
        let upper = name.to_uppercase();
        let short = upper.strip_prefix("SIG").unwrap_or(&upper);
        self.map.get(short).copied()
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver a signal to the parent (the test controller that spawned us).
pub fn notify_parent(signo: i32) -> io::Result<()> {
    let ret = unsafe { libc::kill(libc::getppid(), signo) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Independent background task for the `signal-<NAME>` option: sleep,
/// then signal the parent. Shares nothing with the session loop.
pub fn spawn_delayed_signal(signo: i32) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(DELAYED_SIGNAL_SECS)).await;
        if let Err(e) = notify_parent(signo) {
            crate::error!("failed to deliver delayed signal", "signal" => signo, "error" => e.to_string());
        } else {
            crate::info!("delivered delayed signal to controller", "signal" => signo);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_names() {
        let table = SignalTable::new();
        let cases = [
            ("USR1", libc::SIGUSR1),
            ("SIGUSR1", libc::SIGUSR1),
            ("sigusr2", libc::SIGUSR2),
            ("term", libc::SIGTERM),
            ("SIGHUP", libc::SIGHUP),
        ];
        for (name, expected) in cases {
            assert_eq!(table.lookup(name), Some(expected), "name {}", name);
        }
    }

    #[test]
    fn test_lookup_unknown_name() {
        let table = SignalTable::new();
        assert_eq!(table.lookup("NOSUCH"), None);
        assert_eq!(table.lookup(""), None);
        assert_eq!(table.lookup("SIG"), None);
    }
}

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

use crate::net::Ipv4Net;
use crate::sig::SignalTable;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Behavioral modes, resolved once at startup from CLI flags and the
/// script's `option:` lines; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Accept anything, reply keepalive, never match
    pub sink: bool,
    /// Retransmit every received frame byte-for-byte
    pub echo: bool,
    /// Splice capability 66 into the OPEN reply
    pub send_unknown_capability: bool,
    /// Announce 0.0.0.0/0 right after the handshake
    pub send_default_route: bool,
    /// Send a cease NOTIFICATION after each processed message and treat
    /// peer close as scripted success
    pub send_notification: bool,
    /// First match ends the session successfully
    pub single_shot: bool,
    /// Exit 0 once every step is consumed
    pub exit_on_completion: bool,
    /// Signal delivered to the controller after a fixed delay
    pub delayed_signal: Option<i32>,
}

/// One lettered conversation: expectations grouped by ascending step
/// number, plus whether the whole block compares raw hex dumps.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub steps: BTreeMap<u32, Vec<String>>,
    pub raw: bool,
}

/// A parsed script file: global options and the lettered block pool.
/// Lines without a letter prefix land in block 'A'.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub blocks: BTreeMap<char, Block>,
    pub options: Options,
}

#[derive(Debug)]
pub enum ScriptError {
    Io { path: String, err: String },
    Line { line_no: usize, reason: String },
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Io { path, err } => {
                write!(f, "cannot read script file {}: {}", path, err)
            }
            ScriptError::Line { line_no, reason } => {
                write!(f, "script line {}: {}", line_no, reason)
            }
        }
    }
}

impl Error for ScriptError {}

pub fn load(path: &Path, signals: &SignalTable) -> Result<Script, ScriptError> {
    let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Io {
        path: path.display().to_string(),
        err: e.to_string(),
    })?;
    parse(&text, signals)
}

pub fn parse(text: &str, signals: &SignalTable) -> Result<Script, ScriptError> {
    let mut script = Script::default();

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (letter, rest) = split_block_letter(line);

        let (step_text, spec) = rest.split_once(':').ok_or_else(|| ScriptError::Line {
            line_no,
            reason: format!("expected <step>:<event-spec>, got '{}'", line),
        })?;
        let step: u32 = step_text.parse().map_err(|_| ScriptError::Line {
            line_no,
            reason: format!("invalid step number '{}'", step_text),
        })?;

        let (kind, arg) = spec.split_once(':').unwrap_or((spec, ""));
        match kind {
            "announce" | "withdraw" => {
                let net: Ipv4Net = arg.parse().map_err(|e| ScriptError::Line {
                    line_no,
                    reason: e,
                })?;
                script
                    .blocks
                    .entry(letter)
                    .or_default()
                    .steps
                    .entry(step)
                    .or_default()
                    .push(format!("{}:{}", kind, net));
            }
            "option" => {
                let (_scope, name) = arg.split_once(':').ok_or_else(|| ScriptError::Line {
                    line_no,
                    reason: format!("expected option:<scope>:<name>, got '{}'", spec),
                })?;
                apply_option(&mut script.options, name, signals)
                    .map_err(|reason| ScriptError::Line { line_no, reason })?;
            }
            "signal" => {
                if signals.lookup(arg).is_none() {
                    return Err(ScriptError::Line {
                        line_no,
                        reason: format!("unknown signal name '{}'", arg),
                    });
                }
                script
                    .blocks
                    .entry(letter)
                    .or_default()
                    .steps
                    .entry(step)
                    .or_default()
                    .push(format!("signal:{}", arg));
            }
            "raw" => {
                let hex: String = arg
                    .chars()
                    .filter(|c| *c != ':')
                    .map(|c| c.to_ascii_lowercase())
                    .collect();
                if hex.is_empty() || hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(ScriptError::Line {
                        line_no,
                        reason: format!("invalid raw hex literal '{}'", arg),
                    });
                }
                let block = script.blocks.entry(letter).or_default();
                block.raw = true;
                block.steps.entry(step).or_default().push(hex);
            }
            _ => {
                return Err(ScriptError::Line {
                    line_no,
                    reason: format!("unknown event spec '{}'", spec),
                });
            }
        }
    }

    Ok(script)
}

/// A single uppercase letter followed by ':' names a block; anything
/// else (step numbers included) belongs to block 'A'.
fn split_block_letter(line: &str) -> (char, &str) {
    let bytes = line.as_bytes();
    if bytes.len() > 2 && bytes[0].is_ascii_uppercase() && bytes[1] == b':' {
        (bytes[0] as char, &line[2..])
    } else {
        ('A', line)
    }
}

fn apply_option(
    options: &mut Options,
    name: &str,
    signals: &SignalTable,
) -> Result<(), String> {
    match name {
        "sink" => options.sink = true,
        "echo" => options.echo = true,
        "send-unknown-capability" => options.send_unknown_capability = true,
        "send-default-route" => options.send_default_route = true,
        "send-notification" => options.send_notification = true,
        "single-shot" => options.single_shot = true,
        "exit" => options.exit_on_completion = true,
        _ => {
            if let Some(signal_name) = name.strip_prefix("signal-") {
                let signo = signals
                    .lookup(signal_name)
                    .ok_or_else(|| format!("unknown signal name '{}'", signal_name))?;
                options.delayed_signal = Some(signo);
            } else {
                return Err(format!("unknown option '{}'", name));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Script {
        parse(text, &SignalTable::new()).unwrap()
    }

    fn parse_err(text: &str) -> ScriptError {
        parse(text, &SignalTable::new()).unwrap_err()
    }

    #[test]
    fn test_parse_simple_steps() {
        let script = parse_ok(
            "# conversation one\n\
             1:announce:10.0.0.0/8\n\
             1:withdraw:10.0.0.0/8\n\
             \n\
             2:announce:192.0.2.0/24\n",
        );
        assert_eq!(script.blocks.len(), 1);
        let block = &script.blocks[&'A'];
        assert!(!block.raw);
        assert_eq!(
            block.steps[&1],
            vec!["announce:10.0.0.0/8", "withdraw:10.0.0.0/8"]
        );
        assert_eq!(block.steps[&2], vec!["announce:192.0.2.0/24"]);
    }

    #[test]
    fn test_parse_canonicalizes_prefixes() {
        let script = parse_ok("1:announce:10.0.0.0/08\n");
        assert_eq!(script.blocks[&'A'].steps[&1], vec!["announce:10.0.0.0/8"]);
    }

    #[test]
    fn test_parse_lettered_blocks() {
        let script = parse_ok(
            "A:1:announce:10.0.0.0/8\n\
             B:1:withdraw:192.0.2.0/24\n",
        );
        assert_eq!(script.blocks.len(), 2);
        assert_eq!(script.blocks[&'A'].steps[&1], vec!["announce:10.0.0.0/8"]);
        assert_eq!(script.blocks[&'B'].steps[&1], vec!["withdraw:192.0.2.0/24"]);
    }

    #[test]
    fn test_parse_options_are_global() {
        let script = parse_ok(
            "1:option:session:sink\n\
             1:option:open:send-unknown-capability\n\
             2:option:update:send-default-route\n\
             2:option:session:send-notification\n\
             3:option:session:single-shot\n\
             3:option:session:exit\n\
             4:option:session:signal-SIGUSR1\n",
        );
        let opts = &script.options;
        assert!(opts.sink);
        assert!(opts.send_unknown_capability);
        assert!(opts.send_default_route);
        assert!(opts.send_notification);
        assert!(opts.single_shot);
        assert!(opts.exit_on_completion);
        assert_eq!(opts.delayed_signal, Some(libc::SIGUSR1));
        // option lines never become expectations or blocks
        assert!(script.blocks.is_empty());
    }

    #[test]
    fn test_parse_signal_step() {
        let script = parse_ok("1:announce:10.0.0.0/8\n2:signal:USR1\n");
        assert_eq!(script.blocks[&'A'].steps[&2], vec!["signal:USR1"]);
    }

    #[test]
    fn test_parse_raw_mode() {
        let script = parse_ok("1:raw:FF:FF:00:13:04\n");
        let block = &script.blocks[&'A'];
        assert!(block.raw);
        assert_eq!(block.steps[&1], vec!["ffff001304"]);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        for (text, fragment) in [
            ("nonsense\n", "expected <step>"),
            ("x:announce:10.0.0.0/8\n", "invalid step number"),
            ("1:announce:10.0.0.0\n", "invalid CIDR"),
            ("1:announce:10.0.0.0/33\n", "exceeds 32"),
            ("1:frobnicate:10.0.0.0/8\n", "unknown event spec"),
            ("1:option:session:no-such-option\n", "unknown option"),
            ("1:option:session:signal-NOSUCH\n", "unknown signal"),
            ("1:signal:NOSUCH\n", "unknown signal"),
            ("1:raw:zz\n", "invalid raw hex"),
            ("1:raw:fff\n", "invalid raw hex"),
        ] {
            match parse_err(text) {
                ScriptError::Line { reason, .. } => {
                    assert!(
                        reason.contains(fragment),
                        "text {:?}: reason '{}' missing '{}'",
                        text,
                        reason,
                        fragment
                    );
                }
                other => panic!("text {:?}: expected line error, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/script.msg"), &SignalTable::new()).unwrap_err();
        assert!(matches!(err, ScriptError::Io { .. }));
    }
}

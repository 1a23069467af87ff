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

//! The expectation engine: matches decoded route events against the
//! scripted conversation, step by step.

use crate::script::{Block, Options};
use crate::sig::SignalTable;
use crate::{debug, info};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

/// Verdict for one processed event.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Accepted; the conversation continues
    Matched,
    /// The scripted conversation is complete; exit 0
    Finished,
    /// The event is not among the active expectations; exit 1
    Mismatch {
        event: String,
        expected: Vec<String>,
    },
}

#[derive(Debug)]
pub enum EngineError {
    /// A `signal:` directive names a signal missing from the table
    UnknownSignal(String),
    SignalDelivery(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownSignal(name) => write!(f, "unknown signal name '{}'", name),
            EngineError::SignalDelivery(err) => {
                write!(f, "failed to deliver scripted signal: {}", err)
            }
        }
    }
}

impl Error for EngineError {}

type Notifier = Box<dyn Fn(i32) -> io::Result<()> + Send>;

/// Session-local matcher over one lettered block. Steps are consumed in
/// ascending numeric order; the working set for the active step is never
/// left empty while a step is active.
pub struct ExpectationEngine {
    sequence: BTreeMap<u32, Vec<String>>,
    expected: Vec<String>,
    active_step: Option<u32>,
    counter: u64,
    raw: bool,
    accept_all: bool,
    single_shot: bool,
    exit_on_completion: bool,
    done: bool,
    notifier: Notifier,
}

impl ExpectationEngine {
    pub fn new(block: Block, options: &Options) -> Self {
        ExpectationEngine {
            sequence: block.steps,
            expected: Vec::new(),
            active_step: None,
            counter: 0,
            raw: block.raw,
            accept_all: options.sink || options.echo,
            single_shot: options.single_shot,
            exit_on_completion: options.exit_on_completion,
            done: false,
            notifier: Box::new(crate::sig::notify_parent),
        }
    }

    /// Replace the signal delivery path (tests must not signal the real
    /// parent process).
    #[doc(hidden)]
    pub fn with_notifier(mut self, notifier: impl Fn(i32) -> io::Result<()> + Send + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn raw_mode(&self) -> bool {
        self.raw
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Arm the first step and fire any leading signal directives.
    pub fn start(&mut self, signals: &SignalTable) -> Result<(), EngineError> {
        if !self.advance() {
            self.done = true;
            return Ok(());
        }
        self.check_signal(signals)
    }

    /// Pop the lowest-numbered step into the working set. Sink and echo
    /// sessions accept anything, so their expectations clear on arrival.
    /// Steps emptied by option extraction are skipped.
    fn advance(&mut self) -> bool {
        while let Some((step, expected)) = self.sequence.pop_first() {
            if self.accept_all {
                self.expected.clear();
                self.active_step = Some(step);
                return true;
            }
            if expected.is_empty() {
                continue;
            }
            debug!("advancing to step", "step" => step, "expected" => expected.join(", "));
            self.active_step = Some(step);
            self.expected = expected;
            return true;
        }
        self.active_step = None;
        false
    }

    /// Consume leading `signal:` directives, delivering each to the
    /// controller; a step drained this way advances to the next.
    fn check_signal(&mut self, signals: &SignalTable) -> Result<(), EngineError> {
        loop {
            let name = match self
                .expected
                .first()
                .and_then(|head| head.strip_prefix("signal:"))
            {
                Some(name) => name.to_string(),
                None => break,
            };
            let signo = signals
                .lookup(&name)
                .ok_or(EngineError::UnknownSignal(name))?;
            self.expected.remove(0);
            (self.notifier)(signo).map_err(|e| EngineError::SignalDelivery(e.to_string()))?;
            info!("delivered scripted signal", "signal" => signo, "step" => self.active_step);

            if self.expected.is_empty() && !self.advance() {
                self.done = true;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Match one decoded event against the active step. End-of-RIB and
    /// multiprotocol events are acknowledged by the caller but never
    /// matched.
    pub fn match_event(
        &mut self,
        event: &str,
        signals: &SignalTable,
    ) -> Result<MatchOutcome, EngineError> {
        if self.accept_all {
            return Ok(MatchOutcome::Matched);
        }

        if event.starts_with("eor:") || event.starts_with("mp:") {
            debug!("acknowledged without matching", "event" => event);
            return Ok(MatchOutcome::Matched);
        }

        let Some(position) = self.expected.iter().position(|e| e == event) else {
            return Ok(MatchOutcome::Mismatch {
                event: event.to_string(),
                expected: self.expected.clone(),
            });
        };

        self.expected.remove(position);
        self.counter += 1;
        info!("matched expected event", "event" => event, "step" => self.active_step, "matched" => self.counter);
        self.check_signal(signals)?;

        if self.single_shot {
            self.done = true;
            return Ok(MatchOutcome::Finished);
        }

        if self.expected.is_empty() && !self.done {
            if self.advance() {
                self.check_signal(signals)?;
            } else {
                self.done = true;
            }
        }

        if self.done && self.exit_on_completion {
            return Ok(MatchOutcome::Finished);
        }

        Ok(MatchOutcome::Matched)
    }
}

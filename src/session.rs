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

use crate::bgp::msg::{read_frame, Message, MessageType, RawMessage};
use crate::bgp::msg_keepalive::KeepaliveMessage;
use crate::bgp::msg_notification::NotificationMessage;
use crate::bgp::msg_open::OpenMessage;
use crate::bgp::msg_update::{decode_route_events, UpdateMessage};
use crate::engine::{ExpectationEngine, MatchOutcome};
use crate::script::Options;
use crate::sig::SignalTable;
use crate::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Per-session lifecycle. The only legal transitions are
/// AwaitingOpen → AwaitingMessage → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingOpen,
    AwaitingMessage,
    Closed,
}

/// How a session ended. The listener maps these to the process exit
/// code: the probe is a pass/fail instrument, so a mismatch anywhere is
/// fatal to the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Scripted success; exit 0
    Finished,
    /// Expectation or decode failure; exit 1
    Mismatch,
    /// Configuration error discovered mid-session; exit 1
    ConfigError,
    /// Peer closed (or transport died) without a verdict; the process
    /// keeps serving other connections
    Closed,
}

pub struct Session<R, W> {
    reader: R,
    writer: W,
    peer: String,
    state: SessionState,
    engine: ExpectationEngine,
    options: Arc<Options>,
    signals: Arc<SignalTable>,
    local_ip: Ipv4Addr,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: R,
        writer: W,
        peer: String,
        engine: ExpectationEngine,
        options: Arc<Options>,
        signals: Arc<SignalTable>,
        local_ip: Ipv4Addr,
    ) -> Self {
        Session {
            reader,
            writer,
            peer,
            state: SessionState::AwaitingOpen,
            engine,
            options,
            signals,
            local_ip,
        }
    }

    pub async fn run(mut self) -> SessionOutcome {
        if let Err(e) = self.engine.start(&self.signals) {
            error!("cannot arm expectations", "peer" => &self.peer, "error" => e.to_string());
            return SessionOutcome::ConfigError;
        }
        if self.engine.is_done() && self.options.exit_on_completion {
            info!("scripted conversation already complete", "peer" => &self.peer);
            return SessionOutcome::Finished;
        }

        loop {
            match read_frame(&mut self.reader).await {
                Ok(Some(msg)) => {
                    let outcome = match self.state {
                        SessionState::AwaitingOpen => self.handle_open(msg).await,
                        SessionState::AwaitingMessage => self.handle_message(msg).await,
                        SessionState::Closed => break,
                    };
                    if let Some(outcome) = outcome {
                        self.state = SessionState::Closed;
                        return outcome;
                    }
                }
                Ok(None) => {
                    self.state = SessionState::Closed;
                    if self.options.send_notification {
                        info!("peer closed after notification; scripted success", "peer" => &self.peer, "matched" => self.engine.counter());
                        return SessionOutcome::Finished;
                    }
                    info!("peer closed connection", "peer" => &self.peer, "matched" => self.engine.counter());
                    return SessionOutcome::Closed;
                }
                Err(e) => {
                    self.state = SessionState::Closed;
                    error!("transport failure", "peer" => &self.peer, "error" => e.to_string());
                    return SessionOutcome::Closed;
                }
            }
        }

        SessionOutcome::Closed
    }

    /// The first frame is the peer's OPEN whatever its type octet
    /// claims. The reply echoes it with the router-id low octet bumped,
    /// then a keepalive confirms, then the optional default route goes
    /// out.
    async fn handle_open(&mut self, msg: RawMessage) -> Option<SessionOutcome> {
        let open = match OpenMessage::from_bytes(&msg.body) {
            Ok(open) => open,
            Err(e) => {
                error!("malformed OPEN", "peer" => &self.peer, "error" => e.to_string(), "body" => msg.to_hex());
                return Some(SessionOutcome::Mismatch);
            }
        };
        info!("received OPEN", "peer" => &self.peer, "asn" => open.asn, "hold_time" => open.hold_time, "router_id" => open.router_id_text());

        let reply = open.echo_reply(self.options.send_unknown_capability);
        if let Some(outcome) = self.send(&reply.serialize()).await {
            return Some(outcome);
        }
        if let Some(outcome) = self.send(&KeepaliveMessage::default().serialize()).await {
            return Some(outcome);
        }
        debug!("sent OPEN reply", "peer" => &self.peer, "router_id" => reply.router_id_text());

        if self.options.send_default_route {
            let update = UpdateMessage::default_route(self.local_ip);
            if let Some(outcome) = self.send(&update.serialize()).await {
                return Some(outcome);
            }
            info!("announced default route", "peer" => &self.peer, "next_hop" => self.local_ip.to_string());
        }

        self.state = SessionState::AwaitingMessage;
        None
    }

    async fn handle_message(&mut self, msg: RawMessage) -> Option<SessionOutcome> {
        if self.options.sink {
            info!("sink", "peer" => &self.peer, "type" => msg.msg_type().to_string(), "length" => msg.total_length());
            return self.send(&KeepaliveMessage::default().serialize()).await;
        }
        if self.options.echo {
            info!("echo", "peer" => &self.peer, "type" => msg.msg_type().to_string(), "length" => msg.total_length());
            return self.send(&msg.to_bytes()).await;
        }

        let outcome = if self.engine.raw_mode() {
            self.process_event(&msg.to_hex()).await
        } else {
            self.process_frame(&msg).await
        };
        if outcome.is_some() {
            return outcome;
        }

        if self.options.send_notification {
            let notification = NotificationMessage::scripted_shutdown();
            if let Some(outcome) = self.send(&notification.serialize()).await {
                return Some(outcome);
            }
            info!("sent NOTIFICATION", "peer" => &self.peer, "code" => notification.error_code, "subcode" => notification.subcode);
        }

        None
    }

    async fn process_frame(&mut self, msg: &RawMessage) -> Option<SessionOutcome> {
        match msg.msg_type() {
            MessageType::Update => {
                let events = match decode_route_events(&msg.body) {
                    Ok(events) => events,
                    Err(e) => {
                        error!("failed to decode UPDATE", "peer" => &self.peer, "error" => e.to_string(), "body" => msg.to_hex());
                        return Some(SessionOutcome::Mismatch);
                    }
                };
                for event in events {
                    if let Some(outcome) = self.process_event(&event.to_string()).await {
                        return Some(outcome);
                    }
                }
                None
            }
            MessageType::Keepalive => {
                debug!("received KEEPALIVE", "peer" => &self.peer);
                None
            }
            MessageType::Notification => {
                let notification = NotificationMessage::from_bytes(&msg.body);
                info!("received NOTIFICATION", "peer" => &self.peer, "code" => notification.error_code, "subcode" => notification.subcode, "data" => notification.data_text());
                None
            }
            MessageType::Open => {
                warn!("unexpected OPEN after handshake", "peer" => &self.peer);
                None
            }
            MessageType::Unrecognized(value) => {
                warn!("unrecognized message type", "peer" => &self.peer, "type" => value);
                None
            }
        }
    }

    /// One event through the engine. The keepalive acknowledgement goes
    /// out before the verdict is evaluated.
    async fn process_event(&mut self, event: &str) -> Option<SessionOutcome> {
        if let Some(outcome) = self.send(&KeepaliveMessage::default().serialize()).await {
            return Some(outcome);
        }

        match self.engine.match_event(event, &self.signals) {
            Ok(MatchOutcome::Matched) => None,
            Ok(MatchOutcome::Finished) => {
                info!("scripted conversation complete", "peer" => &self.peer, "matched" => self.engine.counter());
                Some(SessionOutcome::Finished)
            }
            Ok(MatchOutcome::Mismatch { event, expected }) => {
                error!("unexpected event", "peer" => &self.peer, "event" => event, "expected" => expected.join(", "));
                Some(SessionOutcome::Mismatch)
            }
            Err(e) => {
                error!("configuration error", "peer" => &self.peer, "error" => e.to_string());
                Some(SessionOutcome::ConfigError)
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Option<SessionOutcome> {
        match self.writer.write_all(bytes).await {
            Ok(_) => None,
            Err(e) => {
                error!("failed to write to peer", "peer" => &self.peer, "error" => e.to_string());
                Some(SessionOutcome::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg::BGP_MARKER;
    use crate::script::parse;
    use std::str::FromStr;

    fn frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut bytes = BGP_MARKER.to_vec();
        bytes.extend_from_slice(&((19 + body.len()) as u16).to_be_bytes());
        bytes.push(msg_type);
        bytes.extend_from_slice(body);
        bytes
    }

    fn open_frame() -> Vec<u8> {
        // version 4, ASN 65001, hold time 180, identifier 10.0.0.1
        frame(
            1,
            &[0x04, 0xfd, 0xe9, 0x00, 0xb4, 0x0a, 0x00, 0x00, 0x01, 0x00],
        )
    }

    fn update_frame(nlri: &[u8]) -> Vec<u8> {
        let mut body = vec![0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(nlri);
        frame(2, &body)
    }

    fn session_for(
        script_text: &str,
        input: Vec<u8>,
    ) -> (Session<std::io::Cursor<Vec<u8>>, Vec<u8>>, Arc<Options>) {
        let script = parse(script_text, &SignalTable::new()).unwrap();
        let block = script.blocks.get(&'A').cloned().unwrap_or_default();
        let options = Arc::new(script.options.clone());
        let engine = ExpectationEngine::new(block, &script.options).with_notifier(|_| Ok(()));
        let session = Session::new(
            std::io::Cursor::new(input),
            Vec::new(),
            "test".to_string(),
            engine,
            options.clone(),
            Arc::new(SignalTable::new()),
            Ipv4Addr::new(127, 0, 0, 1),
        );
        (session, options)
    }

    fn frames_in(buffer: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut cursor = 0;
        while cursor < buffer.len() {
            let total =
                u16::from_be_bytes([buffer[cursor + 16], buffer[cursor + 17]]) as usize;
            frames.push((
                buffer[cursor + 18],
                buffer[cursor + 19..cursor + total].to_vec(),
            ));
            cursor += total;
        }
        frames
    }

    /// Drive a session in place so the write buffer stays inspectable.
    async fn drive(
        session: &mut Session<std::io::Cursor<Vec<u8>>, Vec<u8>>,
    ) -> Option<SessionOutcome> {
        loop {
            match read_frame(&mut session.reader).await {
                Ok(Some(msg)) => {
                    let outcome = match session.state {
                        SessionState::AwaitingOpen => session.handle_open(msg).await,
                        SessionState::AwaitingMessage => session.handle_message(msg).await,
                        SessionState::Closed => return None,
                    };
                    if outcome.is_some() {
                        return outcome;
                    }
                }
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_then_matching_update_finishes() {
        let mut input = open_frame();
        input.extend_from_slice(&update_frame(&[0x08, 0x0a])); // announce 10.0.0.0/8

        let (session, _) = session_for(
            "1:announce:10.0.0.0/8\n1:option:session:exit\n",
            input,
        );
        assert_eq!(session.run().await, SessionOutcome::Finished);
    }

    #[tokio::test]
    async fn test_open_reply_echoes_with_bumped_router_id() {
        let (mut session, _) = session_for("1:announce:10.0.0.0/8\n", Vec::new());
        session.engine.start(&SignalTable::new()).unwrap();

        let open_raw = RawMessage {
            header: open_frame()[..19].try_into().unwrap(),
            body: open_frame()[19..].to_vec(),
        };
        assert!(session.handle_open(open_raw).await.is_none());
        assert_eq!(session.state, SessionState::AwaitingMessage);

        let sent = frames_in(&session.writer);
        assert_eq!(sent.len(), 2);
        let (open_type, open_body) = &sent[0];
        assert_eq!(*open_type, 1);
        let reply = OpenMessage::from_bytes(open_body).unwrap();
        assert_eq!(reply.asn, 65001);
        assert_eq!(reply.bgp_identifier, 0x0a000002); // 10.0.0.2
        assert_eq!(sent[1].0, 4); // keepalive follows
    }

    #[tokio::test]
    async fn test_unexpected_event_is_mismatch_after_keepalive() {
        let mut input = open_frame();
        input.extend_from_slice(&update_frame(&[0x08, 0x0a]));

        let (mut session, _) = session_for("2:announce:192.0.2.0/24\n", input);
        session.engine.start(&SignalTable::new()).unwrap();
        assert_eq!(drive(&mut session).await, Some(SessionOutcome::Mismatch));

        // the acknowledgement keepalive went out before the verdict
        let sent = frames_in(&session.writer);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].0, 4);
    }

    #[tokio::test]
    async fn test_out_of_order_within_step_succeeds() {
        let mut input = open_frame();
        // withdraw first, then announce, both in step 1
        input.extend_from_slice(&frame(2, &[0x00, 0x02, 0x08, 0x0a, 0x00, 0x00]));
        input.extend_from_slice(&update_frame(&[0x08, 0x0a]));

        let (session, _) = session_for(
            "1:announce:10.0.0.0/8\n\
             1:withdraw:10.0.0.0/8\n\
             1:option:session:exit\n",
            input,
        );
        assert_eq!(session.run().await, SessionOutcome::Finished);
    }

    #[tokio::test]
    async fn test_end_of_rib_acknowledged_not_matched() {
        let mut input = open_frame();
        input.extend_from_slice(&frame(2, &[0x00, 0x00, 0x00, 0x00])); // end-of-RIB
        input.extend_from_slice(&update_frame(&[0x08, 0x0a]));

        let (session, _) = session_for(
            "1:announce:10.0.0.0/8\n1:option:session:exit\n",
            input,
        );
        assert_eq!(session.run().await, SessionOutcome::Finished);
    }

    #[tokio::test]
    async fn test_sink_replies_one_keepalive_per_message() {
        let mut input = open_frame();
        input.extend_from_slice(&update_frame(&[0x08, 0x0a]));
        input.extend_from_slice(&frame(4, &[])); // keepalive
        input.extend_from_slice(&frame(99, &[0xde, 0xad])); // junk type

        let (mut session, _) = session_for("1:option:session:sink\n", input);
        session.engine.start(&SignalTable::new()).unwrap();

        // drive handshake + three sink messages
        assert_eq!(drive(&mut session).await, None);

        let sent = frames_in(&session.writer);
        // OPEN reply + handshake keepalive + exactly one keepalive per
        // sunk message, whatever its type
        assert_eq!(sent.len(), 5);
        assert!(sent[2..].iter().all(|(t, body)| *t == 4 && body.is_empty()));
    }

    #[tokio::test]
    async fn test_echo_returns_exact_bytes() {
        let update = update_frame(&[0x18, 0xc0, 0x00, 0x02]);
        let mut input = open_frame();
        input.extend_from_slice(&update);

        let (mut session, _) = session_for("1:option:session:echo\n", input);
        session.engine.start(&SignalTable::new()).unwrap();
        assert_eq!(drive(&mut session).await, None);

        let sent = frames_in(&session.writer);
        assert_eq!(sent.len(), 3);
        // the retransmission is the exact received frame, header included
        assert_eq!(&session.writer[session.writer.len() - update.len()..], &update[..]);
    }

    #[tokio::test]
    async fn test_malformed_update_is_mismatch_not_panic() {
        let mut input = open_frame();
        input.extend_from_slice(&update_frame(&[0x18, 0x0a])); // /24 truncated

        let (session, _) = session_for("1:announce:10.0.0.0/8\n", input);
        assert_eq!(session.run().await, SessionOutcome::Mismatch);
    }

    #[tokio::test]
    async fn test_peer_close_is_silent_without_notification_option() {
        let (session, _) = session_for("1:announce:10.0.0.0/8\n", open_frame());
        assert_eq!(session.run().await, SessionOutcome::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_is_success_with_notification_option() {
        let (session, _) = session_for(
            "1:announce:10.0.0.0/8\n1:option:session:send-notification\n",
            open_frame(),
        );
        assert_eq!(session.run().await, SessionOutcome::Finished);
    }

    #[tokio::test]
    async fn test_default_route_sent_after_handshake() {
        let (mut session, _) = session_for(
            "1:announce:10.0.0.0/8\n1:option:update:send-default-route\n",
            Vec::new(),
        );
        session.engine.start(&SignalTable::new()).unwrap();

        let open_raw = RawMessage {
            header: open_frame()[..19].try_into().unwrap(),
            body: open_frame()[19..].to_vec(),
        };
        assert!(session.handle_open(open_raw).await.is_none());

        let sent = frames_in(&session.writer);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].0, 2); // trailing UPDATE
        let events = decode_route_events(&sent[2].1).unwrap();
        assert_eq!(
            events,
            vec![crate::bgp::msg_update::RouteEvent::Announce(
                crate::net::Ipv4Net::from_str("0.0.0.0/0").unwrap()
            )]
        );
    }

    #[tokio::test]
    async fn test_unknown_capability_spliced_into_reply() {
        let (mut session, _) = session_for(
            "1:announce:10.0.0.0/8\n1:option:open:send-unknown-capability\n",
            Vec::new(),
        );
        session.engine.start(&SignalTable::new()).unwrap();

        let open_raw = RawMessage {
            header: open_frame()[..19].try_into().unwrap(),
            body: open_frame()[19..].to_vec(),
        };
        assert!(session.handle_open(open_raw).await.is_none());

        let sent = frames_in(&session.writer);
        let reply = OpenMessage::from_bytes(&sent[0].1).unwrap();
        assert_eq!(
            reply.optional_params,
            vec![2, 4, crate::bgp::msg_open::UNKNOWN_CAPABILITY_CODE, 2, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_raw_mode_matches_whole_frames() {
        let keepalive = frame(4, &[]);
        let hex: String = keepalive.iter().map(|b| format!("{:02x}", b)).collect();

        let mut input = open_frame();
        input.extend_from_slice(&keepalive);

        let script_text = format!("1:raw:{}\n1:option:session:exit\n", hex);
        let (session, _) = session_for(&script_text, input);
        assert_eq!(session.run().await, SessionOutcome::Finished);
    }
}

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

use crate::engine::ExpectationEngine;
use crate::net::describe_bind_error;
use crate::script::{Block, Options};
use crate::session::{Session, SessionOutcome};
use crate::sig::SignalTable;
use crate::{debug, error, info};
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accepts BGP connections and hands each one the next unclaimed
/// lettered block. Session outcomes come back over a channel; the first
/// terminal verdict decides the process exit code.
#[derive(Debug)]
pub struct Listener {
    primary: TcpListener,
    secondary: Option<TcpListener>,
    blocks: BTreeMap<char, Block>,
    options: Arc<Options>,
    signals: Arc<SignalTable>,
}

impl Listener {
    /// Bind the primary address and, independently, the IPv6 loopback
    /// on the same port. The second bind failing is tolerated; peers on
    /// dual-stack hosts simply use whichever family came up.
    pub async fn bind(
        addr: SocketAddr,
        blocks: BTreeMap<char, Block>,
        options: Arc<Options>,
        signals: Arc<SignalTable>,
    ) -> Result<Self, String> {
        let primary = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("cannot bind {}: {}", addr, describe_bind_error(&e)))?;

        let port = primary
            .local_addr()
            .map_err(|e| format!("cannot resolve bound address: {}", e))?
            .port();

        let secondary = if addr.ip() == IpAddr::V6(Ipv6Addr::LOCALHOST) {
            None
        } else {
            let v6_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port);
            match TcpListener::bind(v6_addr).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("IPv6 loopback bind failed; continuing without it", "addr" => v6_addr.to_string(), "error" => e.to_string());
                    None
                }
            }
        };

        Ok(Listener {
            primary,
            secondary,
            blocks,
            options,
            signals,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.primary.local_addr()
    }

    /// Accept until a session reaches a verdict. Returns the process
    /// exit code.
    pub async fn serve(self) -> i32 {
        let Listener {
            primary,
            secondary,
            mut blocks,
            options,
            signals,
        } = self;

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                accepted = primary.accept() => {
                    if let Some(code) =
                        spawn_session(accepted, &mut blocks, &outcome_tx, &options, &signals)
                    {
                        return code;
                    }
                }

                accepted = accept_on(&secondary) => {
                    if let Some(code) =
                        spawn_session(accepted, &mut blocks, &outcome_tx, &options, &signals)
                    {
                        return code;
                    }
                }

                Some(outcome) = outcome_rx.recv() => {
                    match outcome {
                        SessionOutcome::Finished => {
                            info!("scripted test passed");
                            return 0;
                        }
                        SessionOutcome::Mismatch => return 1,
                        SessionOutcome::ConfigError => return 1,
                        // a silent close ends only that session
                        SessionOutcome::Closed => {}
                    }
                }
            }
        }
    }
}

async fn accept_on(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Claim the next lettered block for a freshly accepted connection and
/// run it as its own task. Returns an exit code only on fatal
/// configuration errors.
fn spawn_session(
    accepted: io::Result<(TcpStream, SocketAddr)>,
    blocks: &mut BTreeMap<char, Block>,
    outcome_tx: &mpsc::UnboundedSender<SessionOutcome>,
    options: &Arc<Options>,
    signals: &Arc<SignalTable>,
) -> Option<i32> {
    let (stream, peer_addr) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            error!("failed to accept connection", "error" => e.to_string());
            return None;
        }
    };

    let block = match blocks.pop_first() {
        Some((letter, block)) => {
            info!("new peer connection", "peer" => peer_addr.to_string(), "block" => letter.to_string());
            block
        }
        None if options.sink || options.echo => {
            // sink/echo conversations carry no expectations
            info!("new peer connection", "peer" => peer_addr.to_string());
            Block::default()
        }
        None => {
            error!("no scripted block left for connection", "peer" => peer_addr.to_string());
            return Some(1);
        }
    };

    let local_ip = match stream.local_addr() {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::LOCALHOST,
    };

    let engine = ExpectationEngine::new(block, options);
    let (read_half, write_half) = stream.into_split();
    let session = Session::new(
        read_half,
        write_half,
        peer_addr.to_string(),
        engine,
        options.clone(),
        signals.clone(),
        local_ip,
    );

    let outcome_tx = outcome_tx.clone();
    tokio::spawn(async move {
        let _ = outcome_tx.send(session.run().await);
    });

    None
}

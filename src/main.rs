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

use bgprobe::listener::Listener;
use bgprobe::script;
use bgprobe::sig::{spawn_delayed_signal, SignalTable};
use bgprobe::{error, info};
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "bgprobe")]
#[command(about = "Scripted BGP test peer for conformance checking", version)]
struct Args {
    /// Accept everything, reply keepalive, never match
    #[arg(long)]
    sink: bool,

    /// Retransmit every received frame unchanged
    #[arg(long)]
    echo: bool,

    /// TCP port to listen on
    #[arg(long, default_value_t = 179, value_parser = parse_port)]
    port: u16,

    /// Address or hostname to bind (an IPv6 loopback listener is also attempted)
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Path to the scripted-expectation file
    script: PathBuf,
}

fn parse_port(value: &str) -> Result<u16, String> {
    let port: u16 = value
        .parse()
        .map_err(|_| format!("'{}' is not a valid port number", value))?;
    if port == 0 {
        return Err("port must be between 1 and 65535".to_string());
    }
    Ok(port)
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap renders usage with the error; --help/--version land
            // here too and must not report failure
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime", "error" => e.to_string());
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(args)));
}

async fn run(args: Args) -> i32 {
    let signals = Arc::new(SignalTable::new());

    let mut script = match script::load(&args.script, &signals) {
        Ok(script) => script,
        Err(e) => {
            error!("invalid script", "script" => args.script.display().to_string(), "error" => e.to_string());
            return 1;
        }
    };
    script.options.sink |= args.sink;
    script.options.echo |= args.echo;

    let addr = match resolve_bind_addr(&args.bind, args.port) {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address", "bind" => &args.bind, "error" => e);
            return 1;
        }
    };

    if let Some(signo) = script.options.delayed_signal {
        spawn_delayed_signal(signo);
    }

    let options = Arc::new(script.options);
    let listener = match Listener::bind(addr, script.blocks, options, signals).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind failed", "error" => e);
            return 1;
        }
    };

    if let Ok(addr) = listener.local_addr() {
        info!("listening", "addr" => addr.to_string(), "script" => args.script.display().to_string());
    }

    listener.serve().await
}

/// Accepts a literal IP or a resolvable hostname.
fn resolve_bind_addr(bind: &str, port: u16) -> Result<SocketAddr, String> {
    (bind, port)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| format!("'{}' resolves to no address", bind))
}

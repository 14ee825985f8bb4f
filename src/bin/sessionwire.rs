// Copyright 2025 jonefeewang@gmail.com
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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::{Parser, Subcommand};
use dashmap::DashMap;
use dotenv::dotenv;
use sessionwire::{
    setup_tracing, AppError, AppResult, Connector, NetworkService, Packet, Peer, ServiceConfig,
    Session, SessionId,
};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{error, info};

const GREETING_PROTOCOL: i16 = 0;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// accept connections and answer every greeting
    Server,
    /// connect, greet the server once and print the answer
    Client {
        #[arg(short, long, default_value = "Hello, Server!")]
        message: String,
    },
    PrintConfig,
}

/// Answers greetings on one accepted session.
struct GreetingPeer {
    session: Weak<Session>,
    peers: Weak<DashMap<SessionId, Arc<GreetingPeer>>>,
}

impl Peer for GreetingPeer {
    fn on_message(&self, mut packet: Packet) -> AppResult<()> {
        let protocol_id = packet.pop_protocol_id()?;
        if protocol_id != GREETING_PROTOCOL {
            return Err(AppError::HandlerFault(format!(
                "unknown protocol {}",
                protocol_id
            )));
        }
        let text = packet.pop_string()?;
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        info!("session {} says {:?}", session.id(), text);

        let mut reply = Packet::create(GREETING_PROTOCOL);
        reply.push_string("Hello, Client!")?;
        session.send(reply)
    }

    fn on_removed(&self) {
        if let (Some(session), Some(peers)) = (self.session.upgrade(), self.peers.upgrade()) {
            info!("session {} removed", session.id());
            peers.remove(&session.id());
        }
    }
}

/// Forwards the server's answer to the waiting client.
struct ReplyPeer {
    replies: mpsc::UnboundedSender<String>,
}

impl Peer for ReplyPeer {
    fn on_message(&self, mut packet: Packet) -> AppResult<()> {
        packet.pop_protocol_id()?;
        let text = packet.pop_string()?;
        self.replies
            .send(text)
            .map_err(|e| AppError::HandlerFault(format!("reply dropped: {}", e)))
    }

    fn on_removed(&self) {
        info!("disconnected from server");
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let config = if config_path.exists() {
        ServiceConfig::set_up_config(&config_path)?
    } else {
        ServiceConfig::default()
    };

    if let Command::PrintConfig = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _guard = setup_tracing("logs")?;

    rt.block_on(async move {
        match commandline.command {
            Command::Server => run_server(config).await,
            Command::Client { message } => run_client(config, message).await,
            Command::PrintConfig => Ok(()),
        }
    })
}

async fn run_server(config: ServiceConfig) -> AppResult<()> {
    let heartbeat_enabled = config.heartbeat.enabled;
    let service = NetworkService::new(Arc::new(config));
    let peers: Arc<DashMap<SessionId, Arc<GreetingPeer>>> = Arc::new(DashMap::new());

    let registered = Arc::downgrade(&peers);
    service.set_session_created(Arc::new(move |session: &Arc<Session>| {
        let Some(peers) = registered.upgrade() else {
            return;
        };
        let peer = Arc::new(GreetingPeer {
            session: Arc::downgrade(session),
            peers: registered.clone(),
        });
        let weak: Weak<GreetingPeer> = Arc::downgrade(&peer);
        session.set_peer(weak);
        peers.insert(session.id(), peer);
        info!("session {} created from {:?}", session.id(), session.remote_addr());
    }));

    if heartbeat_enabled {
        service.start_heartbeat_checking();
    }

    let listener = service.bind().await?;
    let accept_loop = {
        let service = service.clone();
        tokio::spawn(async move { service.listen(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");
    service.shutdown();
    for entry in service.registry().sessions() {
        entry.ban();
    }
    match accept_loop.await {
        Ok(result) => result,
        Err(e) => Err(AppError::IllegalStateError(format!("accept loop: {}", e))),
    }
}

async fn run_client(config: ServiceConfig, message: String) -> AppResult<()> {
    let addr: SocketAddr = format!("{}:{}", connect_ip(&config.network.ip), config.network.port)
        .parse()
        .map_err(|e| AppError::InvalidValue(format!("server address: {}", e)))?;
    let service = NetworkService::new(Arc::new(config));
    let connector = Connector::new(service.clone());

    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(ReplyPeer {
        replies: replies_tx,
    });
    let session = connector.connect(addr).await?;
    let weak: Weak<ReplyPeer> = Arc::downgrade(&peer);
    session.set_peer(weak);

    let mut greeting = Packet::create(GREETING_PROTOCOL);
    greeting.push_string(&message)?;
    session.send(greeting)?;

    match tokio::time::timeout(Duration::from_secs(5), replies_rx.recv()).await {
        Ok(Some(reply)) => println!("{}", reply),
        Ok(None) => error!("connection closed before the server answered"),
        Err(_) => error!("no answer within 5s"),
    }
    session.disconnect();
    service.shutdown();
    Ok(())
}

fn connect_ip(ip: &str) -> &str {
    if ip == "0.0.0.0" {
        "127.0.0.1"
    } else {
        ip
    }
}

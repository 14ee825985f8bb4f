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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{
    ContextPools, DirectDispatcher, MessageDispatcher, Packet, ReceiveContext, SendContext,
    Session, SessionOptions, SessionOwner, SessionRegistry, TickSource, SYS_START_HEARTBEAT,
};
use crate::{AppError, AppResult};

use super::logic_entry::LogicMessageEntry;
use super::{ServiceConfig, Shutdown};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Called once per new session, before its first message is read.
/// The usual place to attach a [`crate::Peer`].
pub type SessionCreated = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Owns everything sessions share: context pools, the registry, the dispatcher
/// and, when configured, the logic task that serializes message handling.
pub struct NetworkService {
    config: Arc<ServiceConfig>,
    pools: Arc<ContextPools>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<dyn MessageDispatcher>,
    logic_entry: Option<Arc<LogicMessageEntry>>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    session_created: RwLock<Option<SessionCreated>>,
}

impl NetworkService {
    /// Builds pools and registry. Starts the logic task if `use_logic_thread`
    /// is set, so this must run inside a tokio runtime.
    pub fn new(config: Arc<ServiceConfig>) -> Arc<NetworkService> {
        let network = &config.network;
        let pools = Arc::new(ContextPools::new(
            network.max_connection,
            network.buffer_size,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let (notify_shutdown, _) = broadcast::channel(1);

        let (dispatcher, logic_entry): (Arc<dyn MessageDispatcher>, _) =
            if network.use_logic_thread {
                let entry = Arc::new(LogicMessageEntry::new(Arc::downgrade(&registry)));
                entry.start(Shutdown::subscribe(&notify_shutdown));
                (entry.clone(), Some(entry))
            } else {
                (Arc::new(DirectDispatcher), None)
            };

        info!(
            "network service ready, {} contexts of {} bytes, {} dispatch",
            network.max_connection,
            network.buffer_size,
            if logic_entry.is_some() { "logic task" } else { "direct" }
        );

        Arc::new(NetworkService {
            limit_connections: Arc::new(Semaphore::new(network.max_connection)),
            config,
            pools,
            registry,
            dispatcher,
            logic_entry,
            notify_shutdown,
            session_created: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<ContextPools> {
        &self.pools
    }

    pub fn set_session_created(&self, callback: SessionCreated) {
        *self.session_created.write() = Some(callback);
    }

    pub fn logic_entry(&self) -> Option<&Arc<LogicMessageEntry>> {
        self.logic_entry.as_ref()
    }

    pub fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown::subscribe(&self.notify_shutdown)
    }

    /// Binds a socket accepted by this side. Fails with `PoolExhausted` when every
    /// context pair is taken; the socket is dropped, which closes it.
    pub fn on_new_client<S>(&self, socket: S, remote_addr: Option<SocketAddr>) -> AppResult<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.accept_client(socket, remote_addr, None)
    }

    fn accept_client<S>(
        &self,
        socket: S,
        remote_addr: Option<SocketAddr>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (receive, send) = self.pools.acquire_pair()?;
        let session = self.bind_session(socket, remote_addr, receive, send, permit)?;

        let heartbeat = &self.config.heartbeat;
        if heartbeat.enabled {
            let mut packet = Packet::create(SYS_START_HEARTBEAT);
            packet.push_byte(heartbeat.send_interval_secs);
            if let Err(e) = session.send(packet) {
                session.close();
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Binds a socket this side connected. Uses unpooled contexts.
    pub fn on_connect_completed<S>(
        &self,
        socket: S,
        remote_addr: Option<SocketAddr>,
    ) -> AppResult<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.bind_session(
            socket,
            remote_addr,
            ReceiveContext::standalone(self.config.network.buffer_size),
            SendContext::standalone(),
            None,
        )
    }

    fn bind_session<S>(
        &self,
        socket: S,
        remote_addr: Option<SocketAddr>,
        receive: ReceiveContext,
        send: SendContext,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            remote_addr,
            self.dispatcher.clone(),
            SessionOwner {
                registry: Arc::downgrade(&self.registry),
                pools: Some(self.pools.clone()),
            },
            self.session_options(),
        );
        let (reader, writer) = tokio::io::split(socket);
        session.bind(Box::new(reader), Box::new(writer), receive, send, permit)?;

        self.registry.add(session.clone());
        if let Err(e) = session.on_connected() {
            session.close();
            return Err(e);
        }
        let callback = self.session_created.read().clone();
        if let Some(callback) = callback {
            callback(&session);
        }
        if let Err(e) = session.start_receive() {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_body_size: self.config.network.max_body_size,
            max_zero_write_retries: self.config.network.max_zero_write_retries,
            tick_source: TickSource::Timer,
        }
    }

    /// Binds a listener on the configured address.
    pub async fn bind(&self) -> AppResult<TcpListener> {
        let addr = format!("{}:{}", self.config.network.ip, self.config.network.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("bind {}: {}", addr, e)))
    }

    /// Accepts connections until shutdown, waiting for a free slot before each accept.
    ///
    /// Exits with an error only when accepting keeps failing after the backoff.
    pub async fn listen(self: &Arc<Self>, listener: TcpListener) -> AppResult<()> {
        let mut shutdown = self.subscribe_shutdown();
        info!("listening on {:?}", listener.local_addr().ok());
        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::IllegalStateError(format!("connection limit: {}", e)))?,
            };
            let (socket, remote_addr) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = Self::accept(&listener) => accepted?,
            };
            if let Err(e) = socket.set_nodelay(true) {
                warn!("set TCP_NODELAY on {} failed: {}", remote_addr, e);
            }
            debug!("accepted connection from {}", remote_addr);
            if let Err(e) = self.accept_client(socket, Some(remote_addr), Some(permit)) {
                error!("dropping connection from {}: {}", remote_addr, e);
            }
        }
        debug!("accept loop received shutdown signal");
        Ok(())
    }

    async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed: {}, retrying in {}s", err, backoff);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    /// Starts the periodic sweep with the configured check interval and allowance.
    pub fn start_heartbeat_checking(&self) {
        let heartbeat = &self.config.heartbeat;
        self.registry.start_heartbeat_checking(
            heartbeat.check_interval(),
            heartbeat.allowed_duration(),
            self.subscribe_shutdown(),
        );
    }

    pub fn stop_heartbeat_checking(&self) {
        self.registry.stop_heartbeat_checking();
    }

    /// Stops the accept loop, the logic task and the heartbeat sweep.
    /// Live sessions stay open until closed by their owners.
    pub fn shutdown(&self) {
        // no receivers just means nothing is running yet
        let _ = self.notify_shutdown.send(());
        debug!(
            "network service shutting down, {} sessions live, {} messages pending",
            self.registry.count(),
            self.logic_entry.as_ref().map_or(0, |entry| entry.pending())
        );
    }
}

impl Drop for NetworkService {
    fn drop(&mut self) {
        debug!("network service dropped");
    }
}

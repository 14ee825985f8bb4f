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

use std::any::Any;
use std::fmt;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::connection::Connection;
use super::dispatch::MessageDispatcher;
use super::frame::FrameResolver;
use super::heartbeat::{HeartbeatSender, TickSource};
use super::packet::Packet;
use super::pool::{ContextPools, Pooled, ReceiveContext, SendContext};
use super::registry::SessionRegistry;
use super::send_queue::{SendCompletion, SendQueue};
use crate::service::MAX_BODY_SIZE;
use crate::{AppError, AppResult};

/// Close request, either side to its peer. The receiver starts its own disconnect.
pub const SYS_CLOSE_REQ: i16 = -1;
/// Close acknowledgment. Synthesized locally when a session closes.
pub const SYS_CLOSE_ACK: i16 = -2;
/// Start heartbeat, acceptor to connector. Payload: 1-byte interval in seconds.
pub const SYS_START_HEARTBEAT: i16 = -3;
/// Heartbeat liveness update, connector to acceptor.
pub const SYS_UPDATE_HEARTBEAT: i16 = -4;

pub type SessionId = u64;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, no socket yet.
    Idle,
    Connected,
    /// Local close requested while sends were still queued; the write side
    /// shuts down once they are flushed.
    ReserveClosing,
    /// Terminal.
    Closed,
}

/// Application-side handler of one session.
///
/// The session keeps only a weak reference: the peer's lifetime belongs to the
/// application, the session's to its socket and registry.
pub trait Peer: Send + Sync {
    /// An application message, protocol id >= 0. An error closes the session.
    fn on_message(&self, packet: Packet) -> AppResult<()>;

    /// The session is gone or going. Called at most once.
    fn on_removed(&self);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_body_size: usize,
    pub max_zero_write_retries: u32,
    /// How a heartbeat started by the remote side gets its ticks.
    pub tick_source: TickSource,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_body_size: MAX_BODY_SIZE,
            max_zero_write_retries: 16,
            tick_source: TickSource::Timer,
        }
    }
}

/// Where a session returns its resources once it is finalized.
#[derive(Default, Clone)]
pub struct SessionOwner {
    pub registry: Weak<SessionRegistry>,
    pub pools: Option<Arc<ContextPools>>,
}

#[derive(Default)]
struct BoundResources {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    receive_context: Option<ReceiveContext>,
    permit: Option<OwnedSemaphorePermit>,
    finalized: bool,
}

/// One live TCP connection: framing, ordered sends, close handshake and heartbeat.
///
/// I/O runs on two tasks spawned by [`Session::start_receive`] and
/// [`Session::on_connected`]: a receive loop that is the only feeder of the frame
/// resolver, and a writer loop that is the only place a write is ever in flight.
/// Closing cancels both, which releases the socket halves they own.
pub struct Session {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    weak_self: Weak<Session>,
    state: Mutex<SessionState>,
    is_closed: AtomicBool,
    removed_notified: AtomicBool,
    resolver: Mutex<FrameResolver>,
    send_queue: Mutex<SendQueue>,
    write_ready: Notify,
    shutdown_requested: AtomicBool,
    cancel: CancellationToken,
    resources: Mutex<BoundResources>,
    dispatcher: Arc<dyn MessageDispatcher>,
    owner: SessionOwner,
    peer: RwLock<Option<Weak<dyn Peer>>>,
    latest_heartbeat: Mutex<Instant>,
    heartbeat: Mutex<Option<HeartbeatSender>>,
    tick_source: Mutex<TickSource>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        id: SessionId,
        remote_addr: Option<SocketAddr>,
        dispatcher: Arc<dyn MessageDispatcher>,
        owner: SessionOwner,
        options: SessionOptions,
    ) -> Arc<Session> {
        Arc::new_cyclic(|weak_self| Session {
            id,
            remote_addr,
            weak_self: weak_self.clone(),
            state: Mutex::new(SessionState::Idle),
            is_closed: AtomicBool::new(false),
            removed_notified: AtomicBool::new(false),
            resolver: Mutex::new(FrameResolver::new(options.max_body_size)),
            send_queue: Mutex::new(SendQueue::default()),
            write_ready: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            resources: Mutex::new(BoundResources::default()),
            dispatcher,
            owner,
            peer: RwLock::new(None),
            latest_heartbeat: Mutex::new(Instant::now()),
            heartbeat: Mutex::new(None),
            tick_source: Mutex::new(options.tick_source),
            options,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn pending_send_count(&self) -> usize {
        self.send_queue.lock().len()
    }

    pub fn set_peer(&self, peer: Weak<dyn Peer>) {
        *self.peer.write() = Some(peer);
    }

    fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.peer.read().as_ref().and_then(Weak::upgrade)
    }

    /// Completes when the session has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Attaches the socket halves and I/O contexts. Only valid while idle.
    pub fn bind(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        receive_context: ReceiveContext,
        send_context: SendContext,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<()> {
        if self.state() != SessionState::Idle {
            return Err(AppError::IllegalStateError(format!(
                "session {} bound twice",
                self.id
            )));
        }
        {
            let mut resources = self.resources.lock();
            resources.reader = Some(reader);
            resources.writer = Some(writer);
            resources.receive_context = Some(receive_context);
            resources.permit = permit;
        }
        *self.send_queue.lock() = SendQueue::with_context(send_context);
        Ok(())
    }

    /// Idle -> Connected, re-arms the close guard and starts the writer loop.
    pub fn on_connected(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(AppError::IllegalStateError(format!(
                    "session {} is {:?}, expected Idle",
                    self.id, *state
                )));
            }
            *state = SessionState::Connected;
        }
        self.is_closed.store(false, Ordering::SeqCst);
        *self.latest_heartbeat.lock() = Instant::now();

        let writer = self.resources.lock().writer.take();
        let (Some(writer), Some(session)) = (writer, self.weak_self.upgrade()) else {
            return Err(AppError::IllegalStateError(format!(
                "session {} connected without a socket",
                self.id
            )));
        };
        tokio::spawn(session.write_loop(writer));
        debug!("session {} connected, remote {:?}", self.id, self.remote_addr);
        Ok(())
    }

    /// Starts the receive loop. Called once the application had its chance to
    /// attach a peer, so no message arrives before anyone listens.
    pub fn start_receive(&self) -> AppResult<()> {
        let (reader, context) = {
            let mut resources = self.resources.lock();
            (resources.reader.take(), resources.receive_context.take())
        };
        let (Some(reader), Some(context), Some(session)) =
            (reader, context, self.weak_self.upgrade())
        else {
            return Err(AppError::IllegalStateError(format!(
                "session {} has no receive side to start",
                self.id
            )));
        };
        tokio::spawn(Connection::new(reader, context).run(session));
        Ok(())
    }

    /// Feeds raw socket bytes to the frame resolver and dispatches every completed frame.
    pub fn on_receive(&self, data: &[u8]) {
        let mut frames = Vec::new();
        // dispatch happens outside the resolver lock, handlers may close the session
        let result = self
            .resolver
            .lock()
            .on_receive(data, |frame| frames.push(frame));

        if let Some(session) = self.weak_self.upgrade() {
            for frame in frames {
                // a handler may have closed the session on an earlier frame
                if self.is_closed.load(Ordering::SeqCst) {
                    break;
                }
                self.dispatcher.on_message(&session, frame);
            }
        }

        if let Err(e) = result {
            warn!("session {} received a corrupt stream: {}, closing", self.id, e);
            self.close();
        }
    }

    /// Handles one resolved message: control frames here, the rest to the peer.
    pub fn on_message(&self, mut packet: Packet) {
        match packet.protocol_id() {
            SYS_CLOSE_REQ => {
                debug!("session {} got a close request", self.id);
                self.disconnect();
                return;
            }
            SYS_START_HEARTBEAT => {
                let interval = packet.pop_protocol_id().and_then(|_| packet.pop_byte());
                match interval {
                    Ok(secs) => self.begin_heartbeat(secs),
                    Err(e) => warn!("session {} bad start-heartbeat frame: {}", self.id, e),
                }
                return;
            }
            SYS_UPDATE_HEARTBEAT => {
                *self.latest_heartbeat.lock() = Instant::now();
                return;
            }
            SYS_CLOSE_ACK => {
                self.notify_removed();
                if self.state() == SessionState::Closed {
                    self.on_session_closed();
                }
                return;
            }
            _ => {}
        }

        if self.state() == SessionState::Closed {
            trace!(
                "session {} is closed, dropping protocol {}",
                self.id,
                packet.protocol_id()
            );
            return;
        }
        let Some(peer) = self.peer() else {
            trace!(
                "session {} has no peer, dropping protocol {}",
                self.id,
                packet.protocol_id()
            );
            return;
        };
        let protocol_id = packet.protocol_id();
        match panic::catch_unwind(AssertUnwindSafe(|| peer.on_message(packet))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "session {} handler failed on protocol {}: {}, closing",
                    self.id, protocol_id, e
                );
                self.close();
            }
            Err(payload) => {
                error!(
                    "session {} handler panicked on protocol {}: {}, closing",
                    self.id,
                    protocol_id,
                    panic_message(&*payload)
                );
                self.close();
            }
        }
    }

    /// Queues `packet` after stamping its length header.
    pub fn send(&self, mut packet: Packet) -> AppResult<()> {
        packet.record_size()?;
        self.send_bytes(packet.freeze())
    }

    /// Queues an already framed buffer. Only the call that finds the writer
    /// idle wakes it; later calls ride the write in flight.
    pub fn send_bytes(&self, data: Bytes) -> AppResult<()> {
        let start = {
            let mut queue = self.send_queue.lock();
            if self.state() != SessionState::Connected {
                return Err(AppError::SessionClosed(self.id));
            }
            queue.push(data)
        };
        if start {
            self.write_ready.notify_one();
        }
        Ok(())
    }

    /// Active local half-close: shuts the write side now if nothing is queued,
    /// otherwise once the queue has drained.
    pub fn disconnect(&self) {
        let queue = self.send_queue.lock();
        let mut state = self.state.lock();
        if *state != SessionState::Connected {
            return;
        }
        *state = SessionState::ReserveClosing;
        if queue.is_empty() {
            self.shutdown_requested.store(true, Ordering::SeqCst);
            self.write_ready.notify_one();
        }
        debug!(
            "session {} disconnecting, {} sends pending",
            self.id,
            queue.len()
        );
    }

    /// Asks the remote side to close first, so the lingering TIME_WAIT ends up there.
    pub fn ban(&self) {
        if let Err(e) = self.send(Packet::create(SYS_CLOSE_REQ)) {
            debug!("session {} could not send close request: {}", self.id, e);
            self.close();
        }
    }

    /// Idempotent teardown. Concurrent callers race on one compare-and-swap,
    /// only the winner runs the side effects.
    pub fn close(&self) {
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        self.cancel.cancel();
        {
            let mut resources = self.resources.lock();
            resources.reader = None;
            resources.writer = None;
        }
        self.send_queue.lock().clear();
        self.resolver.lock().clear_buffer();
        self.stop_heartbeat();
        info!("session {} closed", self.id);

        // the ack goes through the dispatcher like any inbound frame, so
        // finalization happens on the same thread as the peer's messages
        let mut ack = Packet::create(SYS_CLOSE_ACK);
        if let (Ok(()), Some(session)) = (ack.record_size(), self.weak_self.upgrade()) {
            self.dispatcher
                .on_message(&session, BytesMut::from(ack.as_bytes()));
        }
    }

    fn notify_removed(&self) {
        let Some(peer) = self.peer() else {
            return;
        };
        if self.removed_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| peer.on_removed())) {
            error!(
                "session {} peer panicked while being removed: {}",
                self.id,
                panic_message(&*payload)
            );
        }
    }

    /// Final step after the close-ack went through: leave the registry and give
    /// the contexts back. Runs once.
    fn on_session_closed(&self) {
        let send_context = self.send_queue.lock().take_context();
        let mut resources = self.resources.lock();
        if resources.finalized {
            return;
        }
        resources.finalized = true;

        if let Some(registry) = self.owner.registry.upgrade() {
            registry.remove(self.id);
        }
        if let Some(pools) = &self.owner.pools {
            if send_context.pool_index().is_some() {
                if let Err(e) = pools.send.release(send_context) {
                    error!("session {} send context: {}", self.id, e);
                }
            }
            if let Some(context) = resources.receive_context.take() {
                if let Err(e) = pools.receive.release(context) {
                    error!("session {} receive context: {}", self.id, e);
                }
            }
        }
        resources.permit = None;
        debug!("session {} removed", self.id);
    }

    /// Takes the receive context back from an exited receive loop.
    pub(crate) fn park_receive_context(&self, context: ReceiveContext) {
        let mut resources = self.resources.lock();
        if !resources.finalized {
            resources.receive_context = Some(context);
            return;
        }
        drop(resources);
        if let (Some(pools), Some(_)) = (&self.owner.pools, context.pool_index()) {
            if let Err(e) = pools.receive.release(context) {
                error!("session {} receive context: {}", self.id, e);
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: BoxedWriter) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.write_ready.notified() => {}
            }
            if let Err(e) = self.flush(&mut writer).await {
                warn!("session {} send failed: {}", self.id, e);
                self.close();
                break;
            }
            if self.shutdown_requested.swap(false, Ordering::SeqCst) {
                if let Err(e) = writer.shutdown().await {
                    debug!("session {} write shutdown failed: {}", self.id, e);
                    self.close();
                    break;
                }
            }
        }
        trace!("session {} writer exited", self.id);
    }

    /// Writes until the queue drains, continuing after partial writes.
    async fn flush(&self, writer: &mut BoxedWriter) -> AppResult<()> {
        let mut zero_writes = 0;
        loop {
            let batch = self.send_queue.lock().batch();
            if batch.is_empty() {
                return Ok(());
            }
            let slices: Vec<IoSlice<'_>> = batch.iter().map(|buf| IoSlice::new(buf)).collect();
            let transferred = tokio::select! {
                result = writer.write_vectored(&slices) => result?,
                _ = self.cancel.cancelled() => return Ok(()),
            };

            let (completion, reserve_closing) = {
                let mut queue = self.send_queue.lock();
                let completion = queue.on_sent(transferred);
                (completion, self.state() == SessionState::ReserveClosing)
            };
            match completion {
                SendCompletion::Retry => {
                    zero_writes += 1;
                    if zero_writes > self.options.max_zero_write_retries {
                        return Err(AppError::DetailedIoError(format!(
                            "{} consecutive zero-length writes",
                            zero_writes
                        )));
                    }
                    trace!("session {} zero-length write, retrying", self.id);
                    tokio::task::yield_now().await;
                }
                SendCompletion::Continue => {
                    zero_writes = 0;
                }
                SendCompletion::Drained => {
                    if reserve_closing {
                        writer.shutdown().await?;
                        self.notify_removed();
                    }
                    return Ok(());
                }
            }
        }
    }

    fn begin_heartbeat(&self, interval_secs: u8) {
        if interval_secs == 0 {
            warn!("session {} ignores a zero heartbeat interval", self.id);
            return;
        }
        let source = *self.tick_source.lock();
        let sender = HeartbeatSender::new(
            self.weak_self.clone(),
            Duration::from_secs(interval_secs as u64),
            source,
        );
        if source == TickSource::Timer {
            sender.play();
        }
        debug!(
            "session {} heartbeat every {}s, {:?} driven",
            self.id, interval_secs, source
        );
        // replacing drops the previous sender, which stops its timer
        *self.heartbeat.lock() = Some(sender);
    }

    pub fn start_heartbeat(&self) {
        if let Some(sender) = self.heartbeat.lock().as_ref() {
            sender.play();
        }
    }

    pub fn stop_heartbeat(&self) {
        if let Some(sender) = self.heartbeat.lock().as_ref() {
            sender.stop();
        }
    }

    /// Switches heartbeat ticks to [`Session::update_heartbeat_manually`].
    pub fn disable_auto_heartbeat(&self) {
        *self.tick_source.lock() = TickSource::Manual;
        let mut heartbeat = self.heartbeat.lock();
        if let Some(sender) = heartbeat.take() {
            sender.stop();
            *heartbeat = Some(HeartbeatSender::new(
                self.weak_self.clone(),
                sender.interval(),
                TickSource::Manual,
            ));
        }
    }

    /// Advances a manually driven heartbeat. Returns whether a pulse went out.
    pub fn update_heartbeat_manually(&self, elapsed: Duration) -> bool {
        match self.heartbeat.lock().as_ref() {
            Some(sender) => sender.update(elapsed),
            None => false,
        }
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    pub fn latest_heartbeat(&self) -> Instant {
        *self.latest_heartbeat.lock()
    }

    /// Overrides the last-seen timestamp, for hosts that track liveness themselves.
    pub fn set_latest_heartbeat(&self, at: Instant) {
        *self.latest_heartbeat.lock() = at;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!("session {} dropped", self.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

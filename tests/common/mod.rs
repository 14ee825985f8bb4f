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

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use sessionwire::{
    setup_local_tracing, AppError, AppResult, BoxedReader, BoxedWriter, DirectDispatcher,
    FrameResolver, Packet, Peer, ReceiveContext, SendContext, Session, SessionOptions,
    SessionOwner, SessionRegistry,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = setup_local_tracing();
    });
}

/// Records what the session hands to its peer.
#[derive(Default)]
pub struct RecordingPeer {
    pub messages: Mutex<Vec<Packet>>,
    pub removed: AtomicUsize,
    pub received: Notify,
    pub fail_on: Option<i16>,
    pub panic_on: Option<i16>,
}

impl RecordingPeer {
    pub fn failing_on(protocol_id: i16) -> Self {
        RecordingPeer {
            fail_on: Some(protocol_id),
            ..Default::default()
        }
    }

    pub fn panicking_on(protocol_id: i16) -> Self {
        RecordingPeer {
            panic_on: Some(protocol_id),
            ..Default::default()
        }
    }

    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub async fn wait_for_messages(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.message_count() < count {
                self.received.notified().await;
            }
        })
        .await
        .expect("messages did not arrive in time");
    }
}

impl Peer for RecordingPeer {
    fn on_message(&self, packet: Packet) -> AppResult<()> {
        let protocol_id = packet.protocol_id();
        if self.panic_on == Some(protocol_id) {
            panic!("handler blew up on {}", protocol_id);
        }
        if self.fail_on == Some(protocol_id) {
            return Err(AppError::HandlerFault(format!("refusing {}", protocol_id)));
        }
        self.messages.lock().push(packet);
        self.received.notify_one();
        Ok(())
    }

    fn on_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A transport that accepts at most `max` bytes per write and reports a
/// zero-length write every `zero_every` calls.
pub struct TrickleWriter<W> {
    inner: W,
    max: usize,
    zero_every: usize,
    calls: usize,
}

impl<W> TrickleWriter<W> {
    pub fn new(inner: W, max: usize, zero_every: usize) -> Self {
        TrickleWriter {
            inner,
            max,
            zero_every,
            calls: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TrickleWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.calls += 1;
        if this.zero_every > 0 && this.calls % this.zero_every == 0 {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(this.max);
        Pin::new(&mut this.inner).poll_write(cx, &buf[..n])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Tracks how many writes are inside the transport at once.
pub struct InFlightWriter<W> {
    inner: W,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<W> InFlightWriter<W> {
    /// Returns the writer and a handle to the highest concurrency seen.
    pub fn new(inner: W) -> (Self, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        (
            InFlightWriter {
                inner,
                active: Arc::new(AtomicUsize::new(0)),
                peak: peak.clone(),
            },
            peak,
        )
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for InFlightWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let now = this.active.fetch_add(1, Ordering::SeqCst) + 1;
        this.peak.fetch_max(now, Ordering::SeqCst);
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

pub struct Harness {
    pub session: Arc<Session>,
    pub registry: Arc<SessionRegistry>,
    pub peer: Arc<RecordingPeer>,
}

/// Binds a session to the given halves, registers it, attaches `peer` and
/// starts both I/O loops.
pub fn start_session(
    reader: BoxedReader,
    writer: BoxedWriter,
    peer: RecordingPeer,
    options: SessionOptions,
) -> Harness {
    init_tracing();
    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
    let registry = Arc::new(SessionRegistry::new());
    let session = Session::new(
        NEXT_ID.fetch_add(1, Ordering::Relaxed) as u64,
        None,
        Arc::new(DirectDispatcher),
        SessionOwner {
            registry: Arc::downgrade(&registry),
            pools: None,
        },
        options,
    );
    session
        .bind(
            reader,
            writer,
            ReceiveContext::standalone(1440),
            SendContext::standalone(),
            None,
        )
        .expect("fresh session binds");
    registry.add(session.clone());
    session.on_connected().expect("fresh session connects");

    let peer = Arc::new(peer);
    let weak: std::sync::Weak<RecordingPeer> = Arc::downgrade(&peer);
    session.set_peer(weak);
    session.start_receive().expect("receive side present");
    Harness {
        session,
        registry,
        peer,
    }
}

/// A session over an in-memory pipe. Returns the remote end.
pub fn duplex_session(peer: RecordingPeer, options: SessionOptions) -> (Harness, DuplexStream) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    (
        start_session(Box::new(reader), Box::new(writer), peer, options),
        remote,
    )
}

/// Reads from `remote` until `count` frames arrived.
pub async fn read_packets<R: AsyncRead + Unpin>(remote: &mut R, count: usize) -> Vec<Packet> {
    let mut resolver = FrameResolver::default();
    let mut packets = Vec::new();
    let mut buf = vec![0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        while packets.len() < count {
            let n = remote.read(&mut buf).await.expect("remote read");
            assert!(n > 0, "stream ended after {} frames", packets.len());
            resolver
                .on_receive(&buf[..n], |frame| {
                    packets.push(Packet::from_frame(frame).expect("frame has an id"))
                })
                .expect("well formed stream");
        }
    })
    .await
    .expect("frames did not arrive in time");
    packets
}

/// Reads until end of stream, returning everything read.
pub async fn read_to_end<R: AsyncRead + Unpin>(remote: &mut R) -> Vec<u8> {
    let mut bytes = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut bytes))
        .await
        .expect("stream did not end in time")
        .expect("remote read");
    bytes
}

pub async fn write_packet<W: AsyncWrite + Unpin>(remote: &mut W, mut packet: Packet) {
    packet.record_size().expect("small packet");
    remote
        .write_all(packet.as_bytes())
        .await
        .expect("remote write");
}

pub fn text_packet(protocol_id: i16, text: &str) -> Packet {
    let mut packet = Packet::create(protocol_id);
    packet.push_string(text).expect("short string");
    packet
}

/// Polls `condition` until it holds or the timeout expires.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

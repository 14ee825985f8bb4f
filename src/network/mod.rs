//! Session engine over TCP byte streams.
//!
//! # Layers
//!
//! - `packet`: positional little-endian codec, `[i16 length][i16 protocol id][fields]`
//! - `frame`: reassembles frames from arbitrary read chunks
//! - `send_queue`: ordered outbound buffers with partial-write continuation
//! - `pool`: fixed pools of receive/send contexts, receive buffers sliced from one slab
//! - `session`: per-connection state machine, two-phase close, control frames
//! - `heartbeat`: periodic liveness pulses, timer or manually driven
//! - `dispatch`: where resolved frames are handled
//! - `registry`: live sessions by id, heartbeat sweep
//!
//! Protocol ids below zero are reserved for control frames handled by the session
//! itself; see [`SYS_CLOSE_REQ`] and its siblings.

pub use connection::Connection;
pub use dispatch::{deliver, DirectDispatcher, MessageDispatcher};
pub use frame::FrameResolver;
pub use heartbeat::{HeartbeatSender, TickSource};
pub use packet::{Packet, HEADER_SIZE, PACKET_BUFFER_SIZE};
pub use pool::{ContextPool, ContextPools, Pooled, ReceiveContext, SendContext};
pub use registry::SessionRegistry;
pub use send_queue::{SendCompletion, SendQueue};
pub use session::{
    BoxedReader, BoxedWriter, Peer, Session, SessionId, SessionOptions, SessionOwner,
    SessionState, SYS_CLOSE_ACK, SYS_CLOSE_REQ, SYS_START_HEARTBEAT, SYS_UPDATE_HEARTBEAT,
};

mod connection;
mod dispatch;
mod frame;
mod heartbeat;
mod packet;
mod pool;
mod registry;
mod send_queue;
mod session;

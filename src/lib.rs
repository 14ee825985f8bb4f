mod network;
mod service;
mod utils;

pub use network::{
    deliver, BoxedReader, BoxedWriter, ContextPool, ContextPools, DirectDispatcher,
    FrameResolver, HeartbeatSender, MessageDispatcher, Packet, Peer, Pooled, ReceiveContext,
    SendCompletion, SendContext, SendQueue, Session, SessionId, SessionOptions, SessionOwner,
    SessionRegistry, SessionState, TickSource, HEADER_SIZE, PACKET_BUFFER_SIZE, SYS_CLOSE_ACK,
    SYS_CLOSE_REQ, SYS_START_HEARTBEAT, SYS_UPDATE_HEARTBEAT,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Connector, HeartbeatConfig,
    LogicMessageEntry, NetworkConfig, NetworkService, ServiceConfig, SessionCreated, Shutdown,
    TracingGuard, MAX_BODY_SIZE,
};
pub use utils::DoubleBufferingQueue;

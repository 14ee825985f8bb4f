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

use std::sync::Arc;

use bytes::BytesMut;
use tracing::warn;

use super::packet::Packet;
use super::session::Session;

/// Where resolved frames go.
///
/// Implementations either handle the frame inline on the I/O task or hand it to
/// another thread; either way every frame of a session is delivered in arrival order.
pub trait MessageDispatcher: Send + Sync {
    fn on_message(&self, session: &Arc<Session>, frame: BytesMut);
}

/// Runs handlers on the I/O task that completed the frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDispatcher;

impl MessageDispatcher for DirectDispatcher {
    fn on_message(&self, session: &Arc<Session>, frame: BytesMut) {
        deliver(session, frame);
    }
}

/// Decodes a frame and hands it to its session, closing the session on a frame
/// too short to carry a protocol id.
pub fn deliver(session: &Session, frame: BytesMut) {
    match Packet::from_frame(frame) {
        Ok(packet) => session.on_message(packet),
        Err(e) => {
            warn!("session {} dropped a bad frame: {}", session.id(), e);
            session.close();
        }
    }
}

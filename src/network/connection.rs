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

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use super::pool::ReceiveContext;
use super::session::{BoxedReader, Session};

/// The read side of one session.
///
/// Owns the read half of the socket and the receive buffer; at most one read is
/// outstanding since reads only happen inside [`Connection::run`].
pub struct Connection {
    reader: BoxedReader,
    context: ReceiveContext,
}

impl Connection {
    pub fn new(reader: BoxedReader, context: ReceiveContext) -> Connection {
        Connection { reader, context }
    }

    /// Reads until the remote closes, the read fails or the session is closed.
    ///
    /// A zero-length read is the remote's orderly shutdown and closes the
    /// session. On exit the receive context is handed back to the session,
    /// which returns it to its pool once finalized.
    pub async fn run(mut self, session: Arc<Session>) {
        loop {
            let read = tokio::select! {
                biased;
                _ = session.closed() => break,
                read = self.reader.read(self.context.buffer_mut()) => read,
            };
            match read {
                Ok(0) => {
                    debug!("session {} closed by remote", session.id());
                    session.close();
                    break;
                }
                Ok(n) => {
                    trace!("session {} received {} bytes", session.id(), n);
                    session.on_receive(&self.context.buffer()[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("session {} read failed: {}", session.id(), e);
                    session.close();
                    break;
                }
            }
        }
        let Connection { reader, context } = self;
        drop(reader);
        session.park_receive_context(context);
    }
}

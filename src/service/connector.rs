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
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::network::Session;
use crate::{AppError, AppResult};

use super::NetworkService;

/// Outbound side: connects and binds the socket to a new session of `service`.
pub struct Connector {
    service: Arc<NetworkService>,
}

impl Connector {
    pub fn new(service: Arc<NetworkService>) -> Self {
        Connector { service }
    }

    /// Returns the connected session, or the connect error.
    pub async fn connect(&self, addr: SocketAddr) -> AppResult<Arc<Session>> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("connect to {}: {}", addr, e)))?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!("set TCP_NODELAY toward {} failed: {}", addr, e);
        }
        let session = self.service.on_connect_completed(socket, Some(addr))?;
        debug!("session {} connected to {}", session.id(), addr);
        Ok(session)
    }
}

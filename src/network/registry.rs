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
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use super::session::{Session, SessionId};
use crate::service::Shutdown;

/// Every live session, keyed by id.
///
/// A session is added once its socket and contexts are bound and removed only
/// after its close teardown has run, so membership is what the logic loop
/// checks before dispatching and what the heartbeat sweep walks.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    heartbeat_checker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn exists(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnects every session whose last heartbeat is more than `allowed`
    /// before `now`. Returns how many were disconnected.
    pub fn sweep(&self, now: Instant, allowed: Duration) -> usize {
        // collect first, disconnecting must not run under a shard lock
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().latest_heartbeat()) > allowed)
            .map(|entry| entry.value().clone())
            .collect();

        for session in &stale {
            info!(
                "session {} missed heartbeats for over {:?}, disconnecting",
                session.id(),
                allowed
            );
            session.disconnect();
        }
        stale.len()
    }

    /// Runs [`SessionRegistry::sweep`] every `check_interval` until stopped or shut down.
    pub fn start_heartbeat_checking(
        self: &Arc<Self>,
        check_interval: Duration,
        allowed: Duration,
        mut shutdown: Shutdown,
    ) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let start = Instant::now() + check_interval;
            let mut ticker = time::interval_at(start, check_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("heartbeat checker received shutdown signal");
                        break;
                    }
                    now = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.sweep(now, allowed);
                    }
                }
            }
        });
        if let Some(previous) = self.heartbeat_checker.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_heartbeat_checking(&self) {
        if let Some(handle) = self.heartbeat_checker.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_checker.get_mut().take() {
            handle.abort();
        }
    }
}

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

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::network::{deliver, MessageDispatcher, Session, SessionRegistry};
use crate::utils::DoubleBufferingQueue;
use crate::Shutdown;

type Entry = (Arc<Session>, BytesMut);

/// Serializes all message handling onto one logic task.
///
/// I/O tasks only enqueue; the logic task swaps out whatever accumulated and
/// delivers it in arrival order, so peer handlers never run concurrently.
/// Frames of sessions that already left the registry are dropped.
/// Once the task has stopped, frames are delivered inline instead, so close-acks
/// of sessions closed after shutdown still finalize them.
pub struct LogicMessageEntry {
    queue: DoubleBufferingQueue<Entry>,
    wake: Notify,
    /// Held while enqueueing; nothing is enqueued once it is false.
    running: Mutex<bool>,
    registry: Weak<SessionRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogicMessageEntry {
    pub fn new(registry: Weak<SessionRegistry>) -> Self {
        LogicMessageEntry {
            queue: DoubleBufferingQueue::new(),
            wake: Notify::new(),
            running: Mutex::new(false),
            registry,
            worker: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown: Shutdown) {
        *self.running.lock() = true;
        let entry = self.clone();
        let handle = tokio::spawn(async move {
            let mut batch = VecDeque::new();
            loop {
                let stopping = tokio::select! {
                    _ = shutdown.recv() => true,
                    _ = entry.wake.notified() => false,
                };
                if stopping {
                    debug!("logic message entry received shutdown signal");
                    entry.retire();
                    break;
                }
                entry.queue.swap_into(&mut batch);
                entry.process(&mut batch);
            }
        });
        if let Some(previous) = self.worker.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.retire();
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Switches to inline delivery and flushes what is still queued.
    fn retire(&self) {
        *self.running.lock() = false;
        let mut batch = VecDeque::new();
        loop {
            self.queue.swap_into(&mut batch);
            if batch.is_empty() {
                break;
            }
            self.process(&mut batch);
        }
    }

    fn process(&self, batch: &mut VecDeque<Entry>) {
        let registry = self.registry.upgrade();
        for (session, frame) in batch.drain(..) {
            let registered = registry
                .as_ref()
                .map_or(true, |registry| registry.exists(session.id()));
            if !registered {
                trace!("session {} already removed, dropping frame", session.id());
                continue;
            }
            deliver(&session, frame);
        }
    }
}

impl MessageDispatcher for LogicMessageEntry {
    fn on_message(&self, session: &Arc<Session>, frame: BytesMut) {
        let running = self.running.lock();
        if !*running {
            drop(running);
            deliver(session, frame);
            return;
        }
        if self.queue.enqueue((session.clone(), frame)) {
            self.wake.notify_one();
        }
    }
}

impl Drop for LogicMessageEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

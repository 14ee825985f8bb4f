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

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use super::packet::Packet;
use super::session::{Session, SYS_UPDATE_HEARTBEAT};

/// What drives the heartbeat pulses of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    /// A tokio interval task pulses on its own.
    Timer,
    /// The host calls [`HeartbeatSender::update`] from its own clock.
    Manual,
}

/// Sends the liveness-update control frame to the remote side every `interval`.
///
/// Both tick sources end in the same [`HeartbeatSender::pulse`], so the
/// receiver refreshes its last-seen timestamp identically either way.
pub struct HeartbeatSender {
    session: Weak<Session>,
    interval: Duration,
    source: TickSource,
    elapsed: Mutex<Duration>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatSender {
    pub fn new(session: Weak<Session>, interval: Duration, source: TickSource) -> Self {
        HeartbeatSender {
            session,
            interval,
            source,
            elapsed: Mutex::new(Duration::ZERO),
            timer: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn source(&self) -> TickSource {
        self.source
    }

    pub fn is_playing(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts pulsing. With a timer source the first pulse goes out immediately.
    pub fn play(&self) {
        *self.elapsed.lock() = Duration::ZERO;
        if self.source == TickSource::Manual {
            return;
        }
        let session = self.session.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !Self::pulse(&session) {
                    break;
                }
            }
            trace!("heartbeat timer exited");
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        *self.elapsed.lock() = Duration::ZERO;
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    /// Advances the manual clock by `delta`, pulsing once the interval is reached.
    /// Returns whether a pulse was sent. Ignored for timer-driven senders.
    pub fn update(&self, delta: Duration) -> bool {
        if self.source != TickSource::Manual {
            return false;
        }
        {
            let mut elapsed = self.elapsed.lock();
            *elapsed += delta;
            if *elapsed < self.interval {
                return false;
            }
            *elapsed = Duration::ZERO;
        }
        Self::pulse(&self.session)
    }

    /// False once the session is gone or no longer accepts sends.
    fn pulse(session: &Weak<Session>) -> bool {
        let Some(session) = session.upgrade() else {
            return false;
        };
        match session.send(Packet::create(SYS_UPDATE_HEARTBEAT)) {
            Ok(()) => true,
            Err(e) => {
                debug!("session {} stops heartbeat: {}", session.id(), e);
                false
            }
        }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_source_ignores_manual_updates() {
        let sender = HeartbeatSender::new(Weak::new(), Duration::from_secs(1), TickSource::Timer);
        assert!(!sender.update(Duration::from_secs(5)));
        assert!(!sender.is_playing());
    }

    #[test]
    fn test_manual_pulse_without_session_reports_failure() {
        let sender = HeartbeatSender::new(Weak::new(), Duration::from_secs(2), TickSource::Manual);
        assert!(!sender.update(Duration::from_secs(1)));
        // interval reached, but there is nobody to send through
        assert!(!sender.update(Duration::from_secs(1)));
        // the clock restarted after the attempt
        assert!(!sender.update(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_exits_once_session_is_gone() {
        let sender = HeartbeatSender::new(Weak::new(), Duration::from_secs(1), TickSource::Timer);
        sender.play();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!sender.is_playing());
    }
}

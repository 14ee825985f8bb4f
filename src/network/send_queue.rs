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

use std::mem;

use bytes::{Buf, Bytes};

use super::pool::SendContext;

/// Most buffers handed to a single vectored write.
pub const MAX_WRITE_BATCH: usize = 64;

/// What the writer should do after a write completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCompletion {
    /// Nothing moved although the transport reported success: write again.
    Retry,
    /// Part of the queue is still pending: write the remainder.
    Continue,
    /// Everything queued has reached the transport: the writer goes idle.
    Drained,
}

/// Ordered outbound buffers of one session plus the single-writer flag.
///
/// `push` tells the caller whether it has to start the writer; while a write
/// is in flight, later pushes only append and ride the next write cycle.
/// A write that stops inside an entry leaves that entry's unsent tail at the
/// front of the queue.
#[derive(Debug, Default)]
pub struct SendQueue {
    context: SendContext,
    queued_bytes: usize,
    writing: bool,
}

impl SendQueue {
    pub fn with_context(context: SendContext) -> Self {
        SendQueue {
            context,
            queued_bytes: 0,
            writing: false,
        }
    }

    /// Returns the storage to its pool, leaving an empty unpooled one behind.
    pub fn take_context(&mut self) -> SendContext {
        self.clear();
        mem::take(&mut self.context)
    }

    /// Appends `data`. True when no write is in flight and the caller must start one.
    pub fn push(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            return false;
        }
        self.queued_bytes += data.len();
        self.context.entries.push_back(data);
        if self.writing {
            return false;
        }
        self.writing = true;
        true
    }

    /// The next buffers to write, front first. Cloning `Bytes` only bumps refcounts.
    pub fn batch(&self) -> Vec<Bytes> {
        self.context
            .entries
            .iter()
            .take(MAX_WRITE_BATCH)
            .cloned()
            .collect()
    }

    /// Drops exactly `transferred` bytes from the front of the queue.
    pub fn on_sent(&mut self, transferred: usize) -> SendCompletion {
        if transferred == 0 {
            return SendCompletion::Retry;
        }
        // a write may complete after close already cleared the queue
        let mut remaining = transferred.min(self.queued_bytes);
        self.queued_bytes -= remaining;

        while remaining > 0 {
            let Some(front) = self.context.entries.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.context.entries.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }

        if self.context.entries.is_empty() {
            self.writing = false;
            SendCompletion::Drained
        } else {
            SendCompletion::Continue
        }
    }

    pub fn clear(&mut self) {
        self.context.entries.clear();
        self.queued_bytes = 0;
        self.writing = false;
    }

    pub fn len(&self) -> usize {
        self.context.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.entries.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_push_starts_writer() {
        let mut queue = SendQueue::default();
        assert!(queue.push(Bytes::from_static(b"abc")));
        assert!(!queue.push(Bytes::from_static(b"de")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_bytes(), 5);

        assert_eq!(queue.on_sent(5), SendCompletion::Drained);
        assert!(!queue.is_writing());
        assert!(queue.push(Bytes::from_static(b"f")));
    }

    #[test]
    fn test_partial_write_keeps_unsent_tail() {
        let mut queue = SendQueue::default();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::from_static(b"world"));

        // stops in the middle of the second entry
        assert_eq!(queue.on_sent(7), SendCompletion::Continue);
        assert_eq!(queue.batch(), vec![Bytes::from_static(b"rld")]);
        assert_eq!(queue.queued_bytes(), 3);
        assert!(queue.is_writing());

        // stops in the middle of the first entry
        assert_eq!(queue.on_sent(1), SendCompletion::Continue);
        assert_eq!(queue.batch(), vec![Bytes::from_static(b"ld")]);
        assert_eq!(queue.on_sent(2), SendCompletion::Drained);
    }

    #[test]
    fn test_zero_transfer_retries_without_dropping() {
        let mut queue = SendQueue::default();
        queue.push(Bytes::from_static(b"xyz"));
        assert_eq!(queue.on_sent(0), SendCompletion::Retry);
        assert_eq!(queue.queued_bytes(), 3);
        assert!(queue.is_writing());
    }

    #[test]
    fn test_bounded_writes_converge() {
        let mut queue = SendQueue::default();
        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; (i as usize % 7) + 1];
            expected.extend_from_slice(&chunk);
            queue.push(Bytes::from(chunk));
        }

        let mut wire = Vec::new();
        loop {
            // a transport that takes at most 5 bytes per call
            let mut budget = 5;
            for buf in queue.batch() {
                let n = buf.len().min(budget);
                wire.extend_from_slice(&buf[..n]);
                budget -= n;
                if budget == 0 {
                    break;
                }
            }
            if queue.on_sent(5 - budget) == SendCompletion::Drained {
                break;
            }
        }
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let mut queue = SendQueue::default();
        assert!(!queue.push(Bytes::new()));
        assert!(queue.is_empty());
        assert!(!queue.is_writing());
    }

    #[test]
    fn test_completion_after_clear_drains() {
        let mut queue = SendQueue::default();
        queue.push(Bytes::from_static(b"late"));
        queue.clear();
        assert_eq!(queue.on_sent(4), SendCompletion::Drained);
        assert_eq!(queue.queued_bytes(), 0);
    }
}

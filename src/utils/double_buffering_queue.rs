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
use std::mem;

use parking_lot::Mutex;

/// Producer/consumer handoff with two buffers.
///
/// Producers append to the input buffer under a short lock; the consumer swaps
/// the whole input buffer for its own (empty) one and processes the batch
/// without holding the lock.
#[derive(Debug)]
pub struct DoubleBufferingQueue<T> {
    input: Mutex<VecDeque<T>>,
}

impl<T> Default for DoubleBufferingQueue<T> {
    fn default() -> Self {
        DoubleBufferingQueue {
            input: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> DoubleBufferingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the input buffer was empty before this item.
    pub fn enqueue(&self, item: T) -> bool {
        let mut input = self.input.lock();
        input.push_back(item);
        input.len() == 1
    }

    /// Moves everything queued so far into `output`, which the caller must have drained.
    pub fn swap_into(&self, output: &mut VecDeque<T>) {
        debug_assert!(output.is_empty());
        mem::swap(&mut *self.input.lock(), output);
    }

    pub fn len(&self) -> usize {
        self.input.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.lock().is_empty()
    }
}

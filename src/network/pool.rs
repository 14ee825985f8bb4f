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

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::{AppError, AppResult};

/// An I/O context that can live in a [`ContextPool`].
pub trait Pooled {
    /// Slot in the owning pool, `None` for contexts allocated outside any pool.
    fn pool_index(&self) -> Option<usize>;
    /// Wipes per-connection state before the context is handed out again.
    fn reset(&mut self);
}

/// Receive-side context: a fixed slice of the pool slab that socket reads land in.
#[derive(Debug)]
pub struct ReceiveContext {
    index: Option<usize>,
    buffer: BytesMut,
}

impl ReceiveContext {
    /// Allocates a context that belongs to no pool, used on the connector side.
    pub fn standalone(buffer_size: usize) -> Self {
        ReceiveContext {
            index: None,
            buffer: BytesMut::zeroed(buffer_size),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl Pooled for ReceiveContext {
    fn pool_index(&self) -> Option<usize> {
        self.index
    }
    fn reset(&mut self) {
        self.buffer.fill(0);
    }
}

/// Send-side context. Outbound sizes vary, so instead of a slab slice it
/// carries the reusable storage of a session's send queue.
#[derive(Debug, Default)]
pub struct SendContext {
    index: Option<usize>,
    pub(crate) entries: VecDeque<Bytes>,
}

impl SendContext {
    pub fn standalone() -> Self {
        SendContext::default()
    }
}

impl Pooled for SendContext {
    fn pool_index(&self) -> Option<usize> {
        self.index
    }
    fn reset(&mut self) {
        self.entries.clear();
    }
}

struct PoolInner<T> {
    items: Vec<T>,
    present: Vec<bool>,
}

/// Fixed-capacity stack of reusable contexts.
///
/// The pool never grows: running dry means more sessions are live than the
/// pool was sized for, which is reported instead of papered over. Releasing a
/// context whose slot is already occupied is rejected.
pub struct ContextPool<T: Pooled> {
    name: &'static str,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Pooled> ContextPool<T> {
    fn from_items(name: &'static str, items: Vec<T>) -> Self {
        let present = vec![true; items.len()];
        ContextPool {
            name,
            inner: Mutex::new(PoolInner { items, present }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().present.len()
    }

    pub fn available(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn acquire(&self) -> AppResult<T> {
        let mut inner = self.inner.lock();
        let popped = inner.items.pop();
        let item = match popped {
            Some(item) => item,
            None => {
                let capacity = inner.present.len();
                drop(inner);
                warn!("{} pool exhausted, capacity {}", self.name, capacity);
                return Err(AppError::PoolExhausted(format!(
                    "{} pool, capacity {}",
                    self.name, capacity
                )));
            }
        };
        if let Some(index) = item.pool_index() {
            inner.present[index] = false;
        }
        Ok(item)
    }

    pub fn release(&self, mut item: T) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let index = match item.pool_index() {
            Some(index) if index < inner.present.len() => index,
            other => {
                drop(inner);
                error!("{} pool: released a foreign context {:?}", self.name, other);
                return Err(AppError::PoolMisuse(format!(
                    "{} pool does not own context {:?}",
                    self.name, other
                )));
            }
        };
        if inner.present[index] {
            drop(inner);
            error!("{} pool: context {} released twice", self.name, index);
            return Err(AppError::PoolMisuse(format!(
                "{} pool context {} is already pooled",
                self.name, index
            )));
        }
        item.reset();
        inner.present[index] = true;
        inner.items.push(item);
        Ok(())
    }
}

impl ContextPool<ReceiveContext> {
    /// Allocates one contiguous slab of `capacity * buffer_size` bytes and
    /// slices it into `capacity` receive contexts.
    pub fn with_slab(capacity: usize, buffer_size: usize) -> Self {
        let mut slab = BytesMut::zeroed(capacity * buffer_size);
        let items = (0..capacity)
            .map(|index| ReceiveContext {
                index: Some(index),
                buffer: slab.split_to(buffer_size),
            })
            .collect();
        ContextPool::from_items("receive", items)
    }
}

impl ContextPool<SendContext> {
    pub fn with_capacity(capacity: usize) -> Self {
        let items = (0..capacity)
            .map(|index| SendContext {
                index: Some(index),
                entries: VecDeque::new(),
            })
            .collect();
        ContextPool::from_items("send", items)
    }
}

/// The receive and send pools of one service instance.
pub struct ContextPools {
    pub receive: ContextPool<ReceiveContext>,
    pub send: ContextPool<SendContext>,
}

impl ContextPools {
    pub fn new(max_connection: usize, buffer_size: usize) -> Self {
        ContextPools {
            receive: ContextPool::with_slab(max_connection, buffer_size),
            send: ContextPool::with_capacity(max_connection),
        }
    }

    /// Takes one context from each pool, or none at all.
    pub fn acquire_pair(&self) -> AppResult<(ReceiveContext, SendContext)> {
        let receive = self.receive.acquire()?;
        match self.send.acquire() {
            Ok(send) => Ok((receive, send)),
            Err(e) => {
                self.receive.release(receive)?;
                Err(e)
            }
        }
    }
}

//! Ordered work queue
//!
//! Used as the task queue (caller-visible tasks awaiting their results) and
//! as the inference queue (units awaiting a slot). Both are owned by the
//! submitting side, so the queue itself is not synchronized.

use framebatch_common::{FrameBatchError, Result};
use std::collections::VecDeque;

/// FIFO of pending work
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: VecDeque<T>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Append an item, failing instead of aborting when memory runs out
    pub fn push_back(&mut self, item: T) -> Result<()> {
        self.items
            .try_reserve(1)
            .map_err(|e| FrameBatchError::resource_exhausted(format!("unable to grow queue: {}", e)))?;
        self.items.push_back(item);
        Ok(())
    }

    /// Put an item back at the head of the queue
    pub fn push_front(&mut self, item: T) -> Result<()> {
        self.items
            .try_reserve(1)
            .map_err(|e| FrameBatchError::resource_exhausted(format!("unable to grow queue: {}", e)))?;
        self.items.push_front(item);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek_front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every item, front first
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

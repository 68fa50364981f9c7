//! Priority queue set: one FIFO list per priority band.
//!
//! Band 0 is served first. Within a band, jobs leave in arrival order. The set
//! announces when it leaves and returns to zero so owners can keep background
//! work tied to queue activity.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::events::{Events, LimiterEvent};
use crate::models::NUM_PRIORITIES;

/// Something that can wait in a priority band.
pub trait Queueable {
    fn priority(&self) -> u8;
    fn queue_id(&self) -> &str;
}

impl<T: Queueable> Queueable for Arc<T> {
    fn priority(&self) -> u8 {
        self.as_ref().priority()
    }

    fn queue_id(&self) -> &str {
        self.as_ref().queue_id()
    }
}

#[derive(Debug)]
pub struct Queues<T> {
    lists: Vec<VecDeque<T>>,
    len: usize,
    events: Option<Events>,
}

impl<T: Queueable> Queues<T> {
    pub fn new(events: Option<Events>) -> Self {
        Self {
            lists: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
            len: 0,
            events,
        }
    }

    fn band(priority: u8) -> usize {
        (priority as usize).min(NUM_PRIORITIES - 1)
    }

    fn incr(&mut self) {
        self.len += 1;
        if self.len == 1 {
            if let Some(events) = &self.events {
                events.emit(LimiterEvent::LeftZero);
            }
        }
    }

    fn decr(&mut self) {
        self.len -= 1;
        if self.len == 0 {
            if let Some(events) = &self.events {
                events.emit(LimiterEvent::Zero);
            }
        }
    }

    pub fn push(&mut self, item: T) {
        self.lists[Self::band(item.priority())].push_back(item);
        self.incr();
    }

    /// Waiting jobs in one band, or across all bands.
    pub fn queued(&self, priority: Option<u8>) -> usize {
        match priority {
            Some(p) => self.lists[Self::band(p)].len(),
            None => self.len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Head of the most urgent non-empty band.
    pub fn first(&self) -> Option<&T> {
        self.lists.iter().find_map(|list| list.front())
    }

    pub fn shift_first(&mut self) -> Option<T> {
        let item = self.lists.iter_mut().find_map(|list| list.pop_front())?;
        self.decr();
        Some(item)
    }

    /// Removes the job `id` from band `priority`.
    pub fn remove(&mut self, priority: u8, id: &str) -> Option<T> {
        let list = &mut self.lists[Self::band(priority)];
        let position = list.iter().position(|item| item.queue_id() == id)?;
        let item = list.remove(position)?;
        self.decr();
        Some(item)
    }

    /// Evicts from the least urgent non-empty band at or after `priority`.
    /// The victim is that band's oldest waiter (its front), not its newest
    /// arrival. `priority` may equal the band count, in which case nothing is
    /// evictable.
    pub fn shift_last_from(&mut self, priority: usize) -> Option<T> {
        let item = self
            .lists
            .iter_mut()
            .skip(priority)
            .rev()
            .find_map(|list| list.pop_front())?;
        self.decr();
        Some(item)
    }

    /// Drains every band, most urgent first, FIFO within a band.
    pub fn shift_all(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for list in self.lists.iter_mut() {
            drained.extend(list.drain(..));
        }
        if !drained.is_empty() {
            self.len = 0;
            if let Some(events) = &self.events {
                events.emit(LimiterEvent::Zero);
            }
        }
        drained
    }
}

//! Per-connection (or shared-UDP) outbound queue with three priority
//! classes and an in-flight "current" slot.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::SendQueueInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Cancelled,
    ConnectionLost,
    TimedOut,
}

/// A queued or in-flight outbound payload.
///
/// `async_handle == 0` marks an internal send: invisible to user-facing
/// cancellation and enumeration APIs, but otherwise scheduled identically.
pub struct Buffer {
    pub payload: Bytes,
    pub dest_addr: Option<SocketAddr>,
    pub async_handle: u32,
    pub deadline: Option<Instant>,
    sent: usize,
    completion: Option<Box<dyn FnOnce(SendResult) + Send>>,
}

impl Buffer {
    pub fn new(
        payload: Bytes,
        dest_addr: Option<SocketAddr>,
        async_handle: u32,
        deadline: Option<Instant>,
        completion: impl FnOnce(SendResult) + Send + 'static,
    ) -> Self {
        Self {
            payload,
            dest_addr,
            async_handle,
            deadline,
            sent: 0,
            completion: Some(Box::new(completion)),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.async_handle == 0
    }

    /// Bytes not yet handed to the transport.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.sent..]
    }

    /// Advances the "sent so far" cursor by `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.sent += n;
    }

    pub fn is_exhausted(&self) -> bool {
        self.sent >= self.payload.len()
    }

    pub fn complete(mut self, result: SendResult) {
        if let Some(cb) = self.completion.take() {
            cb(result);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(cb) = self.completion.take() {
            cb(SendResult::Cancelled);
        }
    }
}

#[derive(Default)]
pub struct SendQueue {
    low: VecDeque<Buffer>,
    medium: VecDeque<Buffer>,
    high: VecDeque<Buffer>,
    current: Option<Buffer>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Buffer> {
        match priority {
            Priority::Low => &mut self.low,
            Priority::Medium => &mut self.medium,
            Priority::High => &mut self.high,
        }
    }

    fn queue(&self, priority: Priority) -> &VecDeque<Buffer> {
        match priority {
            Priority::Low => &self.low,
            Priority::Medium => &self.medium,
            Priority::High => &self.high,
        }
    }

    pub fn send(&mut self, priority: Priority, buffer: Buffer) {
        self.queue_mut(priority).push_back(buffer);
    }

    /// Returns the in-flight payload, or pops and promotes the
    /// highest-priority non-empty class to "current".
    pub fn get_pending(&mut self) -> Option<&mut Buffer> {
        if self.current.is_none() {
            self.current = self
                .high
                .pop_front()
                .or_else(|| self.medium.pop_front())
                .or_else(|| self.low.pop_front());
        }

        self.current.as_mut()
    }

    /// Releases the current operation. Panics if nothing is current, which
    /// would indicate a caller bug (double pop).
    pub fn pop_pending(&mut self) -> Buffer {
        self.current.take().expect("no current send to pop")
    }

    pub fn handle_is_pending(&self, handle: u32) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.async_handle == handle)
    }

    /// Removes and returns the oldest user-visible (non-internal) queued
    /// buffer, HIGH first, leaving the in-flight operation untouched.
    pub fn remove_queued(&mut self) -> Option<Buffer> {
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            if let Some(pos) = self.queue(priority).iter().position(|b| !b.is_internal()) {
                return self.queue_mut(priority).remove(pos);
            }
        }

        None
    }

    pub fn remove_queued_by_handle(&mut self, handle: u32) -> Option<Buffer> {
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            if let Some(pos) = self
                .queue(priority)
                .iter()
                .position(|b| !b.is_internal() && b.async_handle == handle)
            {
                return self.queue_mut(priority).remove(pos);
            }
        }

        None
    }

    pub fn remove_queued_by_priority(&mut self, priority: Priority) -> Option<Buffer> {
        let pos = self
            .queue(priority)
            .iter()
            .position(|b| !b.is_internal())?;

        self.queue_mut(priority).remove(pos)
    }

    /// Drains every queued (non-current), user-visible buffer in `priority`,
    /// or across all three classes when `priority` is `None`, completing
    /// each with `result` and returning its async handle.
    pub fn drain_queued_by_priority(&mut self, priority: Option<Priority>, result: SendResult) -> Vec<u32> {
        let priorities: &[Priority] = match &priority {
            Some(p) => std::slice::from_ref(p),
            None => &[Priority::High, Priority::Medium, Priority::Low],
        };

        let mut handles = Vec::new();
        for &p in priorities {
            while let Some(buffer) = self.remove_queued_by_priority(p) {
                handles.push(buffer.async_handle);
                buffer.complete(result);
            }
        }
        handles
    }

    /// Total queued (not in-flight), user-visible message count and byte
    /// size across all three priority classes.
    pub fn queued_stats(&self) -> SendQueueInfo {
        let mut info = SendQueueInfo::default();
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            let class = self.queued_in(priority);
            info.messages += class.messages;
            info.bytes += class.bytes;
        }
        info
    }

    /// Queued (not in-flight), user-visible message count and byte size
    /// for one priority class.
    pub fn queued_in(&self, priority: Priority) -> SendQueueInfo {
        let mut info = SendQueueInfo::default();
        for buffer in self.queue(priority) {
            if !buffer.is_internal() {
                info.messages += 1;
                info.bytes += buffer.remaining().len() as u64;
            }
        }
        info
    }

    /// Completes and drops every queued (non-current) buffer with the given
    /// result, both internal and user-visible. Used by `Close`.
    pub fn drain(&mut self, result: SendResult) {
        self.drain_handles(result);
    }

    /// Like [`SendQueue::drain`], but returns the async handle of every
    /// user-visible (non-internal) buffer completed, so a caller can raise
    /// one completion event per handle.
    pub fn drain_handles(&mut self, result: SendResult) -> Vec<u32> {
        let mut handles = Vec::new();

        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            while let Some(buffer) = self.queue_mut(priority).pop_front() {
                if buffer.async_handle != 0 {
                    handles.push(buffer.async_handle);
                }
                buffer.complete(result);
            }
        }

        handles
    }

    /// Completes buffers whose deadline has passed with `TimedOut`, without
    /// touching the in-flight current buffer (a deadline can't save a send
    /// that already left the queue). Returns the async handle of each
    /// buffer expired, so a caller can raise one `SendComplete` per handle.
    pub fn expire_timeouts(&mut self, now: Instant) -> Vec<u32> {
        let mut handles = Vec::new();

        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            let queue = self.queue_mut(priority);
            let mut expired = VecDeque::new();

            while let Some(pos) = queue
                .iter()
                .position(|b| b.deadline.is_some_and(|d| now >= d))
            {
                expired.push_back(queue.remove(pos).unwrap());
            }

            for buffer in expired {
                if buffer.async_handle != 0 {
                    handles.push(buffer.async_handle);
                }
                buffer.complete(SendResult::TimedOut);
            }
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn buf(async_handle: u32) -> Buffer {
        Buffer::new(Bytes::from_static(b"x"), None, async_handle, None, |_| {})
    }

    #[test]
    fn high_priority_drains_before_medium_and_low() {
        let mut q = SendQueue::new();
        q.send(Priority::Low, buf(1));
        q.send(Priority::Medium, buf(2));
        q.send(Priority::High, buf(3));

        assert_eq!(q.get_pending().unwrap().async_handle, 3);
        q.pop_pending();
        assert_eq!(q.get_pending().unwrap().async_handle, 2);
        q.pop_pending();
        assert_eq!(q.get_pending().unwrap().async_handle, 1);
    }

    #[test]
    fn current_stays_current_until_popped() {
        let mut q = SendQueue::new();
        q.send(Priority::High, buf(1));
        q.send(Priority::High, buf(2));

        assert_eq!(q.get_pending().unwrap().async_handle, 1);
        assert_eq!(q.get_pending().unwrap().async_handle, 1);
    }

    #[test]
    fn internal_sends_are_invisible_to_remove_queued() {
        let mut q = SendQueue::new();
        q.send(Priority::High, buf(0));
        q.send(Priority::High, buf(5));

        let removed = q.remove_queued().unwrap();
        assert_eq!(removed.async_handle, 5);
    }

    #[test]
    fn handle_is_pending_only_for_current() {
        let mut q = SendQueue::new();
        q.send(Priority::High, buf(7));
        q.get_pending();

        assert!(q.handle_is_pending(7));
        assert!(!q.handle_is_pending(8));
    }

    #[test]
    fn expire_timeouts_completes_only_buffers_past_their_deadline() {
        use std::time::Duration;

        let mut q = SendQueue::new();
        let past = Instant::now() - Duration::from_secs(1);
        let future = Instant::now() + Duration::from_secs(60);

        q.send(Priority::Low, Buffer::new(Bytes::from_static(b"x"), None, 1, Some(past), |_| {}));
        q.send(Priority::Low, Buffer::new(Bytes::from_static(b"x"), None, 2, Some(future), |_| {}));
        q.send(Priority::Low, Buffer::new(Bytes::from_static(b"x"), None, 3, None, |_| {}));

        let expired = q.expire_timeouts(Instant::now());
        assert_eq!(expired, vec![1]);

        let remaining: Vec<u32> = std::iter::from_fn(|| q.remove_queued_by_priority(Priority::Low).map(|b| b.async_handle)).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[test]
    fn dropping_uncompleted_buffer_reports_cancelled() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let buffer = Buffer::new(Bytes::from_static(b"x"), None, 1, None, move |result| {
            assert_eq!(result, SendResult::Cancelled);
            ran2.store(true, Ordering::SeqCst);
        });

        drop(buffer);
        assert!(ran.load(Ordering::SeqCst));
    }
}

//! Latest-wins delivery queue for metering frames.
//!
//! Meters are only interesting at their newest value. A slow consumer must
//! not build a backlog, so the queue holds at most `depth` frames and pushing
//! onto a full queue drops the oldest one.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct LatestQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    depth: usize,
}

impl<T> LatestQueue<T> {
    /// `depth` is clamped to at least 1.
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(depth),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Enqueue `item`, dropping the oldest entry if full.
    /// Returns true if something was dropped. Pushing onto a closed queue is a no-op.
    pub fn push(&self, item: T) -> bool {
        let superseded = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let superseded = if state.items.len() >= self.depth {
                state.items.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(item);
            superseded
        };
        self.notify.notify_one();
        superseded
    }

    pub fn try_recv(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Frames dropped because a newer one replaced them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

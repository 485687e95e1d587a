//! Per-connection outbound queue.
//!
//! A single write loop drains this queue so frame writes never interleave.
//! Progress frames are bounded: past the cap, the oldest undelivered
//! progress frame is dropped. Terminal frames are never dropped.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Notify;

use {
    relay_metrics::{counter, daemon},
    relay_protocol::Frame,
};

struct Queued {
    text: String,
    is_progress: bool,
}

pub struct ConnQueue {
    frames: Mutex<VecDeque<Queued>>,
    notify: Notify,
    closed: AtomicBool,
    progress_cap: usize,
}

impl ConnQueue {
    #[must_use]
    pub fn new(progress_cap: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            progress_cap,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Queued>> {
        match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a frame for the write loop. Returns `false` once closed.
    pub fn send(&self, frame: &Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let is_progress = matches!(frame, Frame::Progress { .. });
        let mut frames = self.lock();

        if is_progress {
            let buffered = frames.iter().filter(|q| q.is_progress).count();
            if buffered >= self.progress_cap {
                if let Some(idx) = frames.iter().position(|q| q.is_progress) {
                    frames.remove(idx);
                    counter!(daemon::PROGRESS_DROPPED_TOTAL).increment(1);
                }
            }
        }

        frames.push_back(Queued {
            text: frame.to_json(),
            is_progress,
        });
        drop(frames);
        self.notify.notify_one();
        true
    }

    /// Next frame to write, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<String> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking so a notify between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if let Some(queued) = self.lock().pop_front() {
                return Some(queued.text);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Stop accepting frames and wake the write loop to drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use relay_protocol::{ErrorKind, ErrorShape, ProgressLevel};

    use super::*;

    fn progress(n: usize) -> Frame {
        Frame::Progress {
            request_id: "r".into(),
            level: ProgressLevel::Info,
            message: format!("p{n}"),
            fields: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_progress() {
        let queue = ConnQueue::new(2);
        queue.send(&progress(0));
        queue.send(&progress(1));
        queue.send(&progress(2));
        assert_eq!(queue.len(), 2);
        let first = queue.lock().pop_front().unwrap();
        assert!(first.text.contains("p1"));
    }

    #[test]
    fn terminal_frames_are_never_dropped() {
        let queue = ConnQueue::new(1);
        queue.send(&progress(0));
        for _ in 0..10 {
            queue.send(&Frame::error(
                Some("r".into()),
                ErrorShape::new(ErrorKind::Internal, "x"),
            ));
        }
        // 1 progress + 10 terminals.
        assert_eq!(queue.len(), 11);
    }

    #[tokio::test]
    async fn recv_drains_then_ends_after_close() {
        let queue = ConnQueue::new(8);
        queue.send(&progress(0));
        queue.close();
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
        assert!(!queue.send(&progress(1)));
    }
}

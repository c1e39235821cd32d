//! FIFO of encoded frames waiting for playback.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// One encoded audio unit. The payload is shared, never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub duration_ms: u32,
}

impl AudioFrame {
    pub fn new(payload: impl Into<Bytes>, duration_ms: u32) -> Self {
        Self {
            payload: payload.into(),
            duration_ms,
        }
    }
}

/// Mutex-guarded queue. Only the dispatcher thread and inbound network
/// handlers touch it; critical sections are a single push or pop.
#[derive(Debug, Default)]
pub struct DecodeQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
}

impl DecodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, frame: AudioFrame) {
        self.lock().push_back(frame);
    }

    pub fn extend(&self, frames: impl IntoIterator<Item = AudioFrame>) {
        self.lock().extend(frames);
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.lock().pop_front()
    }

    /// Discard everything queued. Returns how many frames were dropped.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.lock());
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_clear() {
        let queue = DecodeQueue::new();
        queue.push(AudioFrame::new(vec![1u8], 60));
        queue.extend([AudioFrame::new(vec![2u8], 60), AudioFrame::new(vec![3u8], 60)]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().payload.as_ref(), &[1]);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn frames_share_payload() {
        let payload = Bytes::from_static(b"opus");
        let frame = AudioFrame::new(payload.clone(), 60);
        assert_eq!(frame.payload.as_ptr(), payload.as_ptr());
    }
}

//! Priority fan-out for screen media.
//!
//! Inbound SCREEN_FRAME / SCREEN_AUDIO messages become queue items; a single
//! scheduler task drains them. Audio is sacred, keyframes are sacred, and
//! intra-GOP deltas are the only thing allowed to die under load.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use super::registry::{OutMsg, Registry};

/// Target queue depth; beyond it, delta frames are shed oldest-first.
pub const QUEUE_DEPTH: usize = 60;

#[derive(Clone)]
pub struct RelayItem {
    pub data: OutMsg,
    pub sharer_id: u32,
    pub is_audio: bool,
    pub is_keyframe: bool,
}

pub struct RelayQueue {
    queue: Mutex<VecDeque<RelayItem>>,
    notify: Notify,
}

impl RelayQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, item: RelayItem) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(item);
            // Over capacity: shed the oldest delta frame. If only audio and
            // keyframes remain, accept brief growth instead of dropping.
            while queue.len() > QUEUE_DEPTH {
                let victim = queue
                    .iter()
                    .position(|item| !item.is_audio && !item.is_keyframe);
                match victim {
                    Some(idx) => {
                        queue.remove(idx);
                    }
                    None => break,
                }
            }
        }
        self.notify.notify_one();
    }

    /// Wait (bounded) for work, then take everything queued.
    pub async fn next_batch(&self) -> Vec<RelayItem> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap();
                if !queue.is_empty() {
                    return queue.drain(..).collect();
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(5), self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a batch into sends: all audio in arrival order, and per sharer
/// every keyframe plus the newest video frame. Older deltas are dropped.
pub fn plan_batch(batch: Vec<RelayItem>) -> (Vec<RelayItem>, Vec<RelayItem>) {
    let mut audio = Vec::new();
    let mut videos = Vec::new();
    for item in batch {
        if item.is_audio {
            audio.push(item);
        } else {
            videos.push(item);
        }
    }

    let mut newest: HashMap<u32, usize> = HashMap::new();
    for (idx, item) in videos.iter().enumerate() {
        newest.insert(item.sharer_id, idx);
    }
    let kept = videos
        .into_iter()
        .enumerate()
        .filter(|(idx, item)| item.is_keyframe || newest[&item.sharer_id] == *idx)
        .map(|(_, item)| item)
        .collect();
    (audio, kept)
}

/// The scheduler task. Runs until the server shuts down.
pub async fn run(queue: Arc<RelayQueue>, registry: Arc<Registry>) {
    loop {
        let batch = queue.next_batch().await;
        let (audio, videos) = plan_batch(batch);

        // Audio first, in arrival order, with blocking-send semantics: a
        // slow subscriber backpressures rather than losing sound.
        for item in audio {
            for channel in registry.subscriber_channels(item.sharer_id) {
                let _ = channel.send(item.data.clone()).await;
            }
        }

        // Video is best-effort per subscriber: a full outbound queue means
        // the frame is dropped for that subscriber only. Keyframes get the
        // same treatment; a subscriber that misses one is re-synced by the
        // cached-keyframe path.
        for item in videos {
            for channel in registry.subscriber_channels(item.sharer_id) {
                if channel.try_send(item.data.clone()).is_err() {
                    debug!(sharer = item.sharer_id, "subscriber stalled, dropping video frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sharer: u32, tag: u8, is_audio: bool, is_keyframe: bool) -> RelayItem {
        RelayItem {
            data: Arc::new(vec![tag]),
            sharer_id: sharer,
            is_audio,
            is_keyframe,
        }
    }

    #[test]
    fn test_overload_sheds_only_deltas() {
        let queue = RelayQueue::new();
        for i in 0..QUEUE_DEPTH {
            queue.enqueue(item(1, i as u8, false, false));
        }
        // Audio past the cap displaces the oldest delta, never itself.
        for _ in 0..5 {
            queue.enqueue(item(1, 200, true, false));
        }
        assert_eq!(queue.len(), QUEUE_DEPTH);
        let batch = futures_block(queue.next_batch());
        assert_eq!(batch.iter().filter(|i| i.is_audio).count(), 5);
    }

    #[test]
    fn test_keyframes_never_dropped_by_queue() {
        let queue = RelayQueue::new();
        for i in 0..QUEUE_DEPTH {
            queue.enqueue(item(1, i as u8, false, true));
        }
        // Nothing is droppable; the queue grows past its target instead.
        queue.enqueue(item(1, 99, false, true));
        assert_eq!(queue.len(), QUEUE_DEPTH + 1);
        let batch = futures_block(queue.next_batch());
        assert!(batch.iter().all(|i| i.is_keyframe));
    }

    #[test]
    fn test_plan_sends_newest_video_only() {
        // S6 shape: a burst of deltas from one sharer plus interleaved audio.
        let mut batch = Vec::new();
        for i in 0..60u8 {
            batch.push(item(1, i, false, false));
        }
        batch.push(item(1, 100, true, false));
        batch.push(item(1, 101, true, false));

        let (audio, videos) = plan_batch(batch);
        assert_eq!(audio.len(), 2);
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].data[0], 59); // the newest delta
    }

    #[test]
    fn test_plan_keeps_keyframes_alongside_newest() {
        let batch = vec![
            item(1, 0, false, false),
            item(1, 1, false, true), // keyframe mid-batch
            item(1, 2, false, false),
            item(1, 3, false, false),
        ];
        let (_, videos) = plan_batch(batch);
        let tags: Vec<u8> = videos.iter().map(|i| i.data[0]).collect();
        assert_eq!(tags, vec![1, 3]); // keyframe survives, then newest delta
    }

    #[test]
    fn test_plan_is_per_sharer() {
        let batch = vec![
            item(1, 10, false, false),
            item(2, 20, false, false),
            item(1, 11, false, false),
            item(2, 21, false, false),
        ];
        let (_, videos) = plan_batch(batch);
        let tags: Vec<u8> = videos.iter().map(|i| i.data[0]).collect();
        assert_eq!(tags, vec![11, 21]);
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(fut)
    }
}

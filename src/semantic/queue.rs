//! KeyFrame queues shared between the semantic workers.
//!
//! The segmentation request queue is a mutex-guarded FIFO of [`KeyFrameId`]
//! handles with a condition variable signaled on push and on wake-up requests
//! (finish, enable), since the dispatcher drains and filters it as a whole.
//! Critical sections cover only the push/drain itself; callers never hold the
//! lock while touching the atlas or calling a service.
//!
//! Labeled keyframes are handed to semantic tracking, and from there to
//! semantic BA, over [`KeyFrameChannel`]s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::atlas::map::KeyFrameId;
use crate::system::SharedState;

use super::stats::SemanticStats;

/// Worker-to-worker hand-off of keyframe handles.
///
/// Both ends live in the context, so the channel never disconnects while a
/// worker runs.
pub struct KeyFrameChannel {
    name: &'static str,
    tx: Sender<KeyFrameId>,
    rx: Receiver<KeyFrameId>,
}

impl KeyFrameChannel {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded();
        Self { name, tx, rx }
    }

    pub fn push(&self, kf_id: KeyFrameId) {
        if self.tx.send(kf_id).is_err() {
            warn!("{} channel closed, {} dropped", self.name, kf_id);
        }
    }

    /// Oldest handle, without blocking.
    pub fn pop(&self) -> Option<KeyFrameId> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<KeyFrameId, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<KeyFrameId> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl std::fmt::Debug for KeyFrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrameChannel")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// A FIFO of keyframe handles with blocking waits.
struct KeyFrameQueue {
    items: Mutex<VecDeque<KeyFrameId>>,
    changed: Condvar,
}

impl KeyFrameQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            changed: Condvar::new(),
        }
    }

    /// Append to the tail and wake waiters.
    fn push(&self, kf_id: KeyFrameId) {
        let mut items = self.items.lock();
        items.push_back(kf_id);
        self.changed.notify_all();
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Remove and return every queued handle, oldest first.
    fn drain(&self) -> Vec<KeyFrameId> {
        self.items.lock().drain(..).collect()
    }

    /// Block until `ready(len)` holds, a wake-up arrives, or `timeout` passes.
    ///
    /// `ready` is evaluated with the queue lock held, so a flag checked inside
    /// it cannot miss a [`KeyFrameQueue::wake_all`] issued after the flag was
    /// set. Returns the final value of `ready`.
    fn wait_until(&self, timeout: Duration, mut ready: impl FnMut(usize) -> bool) -> bool {
        let mut items = self.items.lock();
        if ready(items.len()) {
            return true;
        }
        self.changed.wait_for(&mut items, timeout);
        ready(items.len())
    }

    /// Wake every waiter so it re-evaluates its condition.
    fn wake_all(&self) {
        let _items = self.items.lock();
        self.changed.notify_all();
    }
}

/// Queue of keyframes waiting for segmentation.
///
/// A batch is ready once the enable switch is on and at least `batch_size`
/// keyframes are queued.
pub struct SegmentationRequestQueue {
    queue: KeyFrameQueue,
    batch_size: usize,
    enabled: AtomicBool,
    /// Newest keyframe ever enqueued, stored as id + 1 (0 = none).
    latest_enqueued: AtomicU64,
}

impl SegmentationRequestQueue {
    pub fn new(batch_size: usize, enabled: bool) -> Self {
        Self {
            queue: KeyFrameQueue::new(),
            batch_size: batch_size.max(1),
            enabled: AtomicBool::new(enabled),
            latest_enqueued: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enable switch. Enabling wakes the dispatcher.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.queue.wake_all();
    }

    /// Append a keyframe to the tail.
    pub fn enqueue(&self, kf_id: KeyFrameId) {
        self.latest_enqueued
            .fetch_max(kf_id.0.saturating_add(1), Ordering::SeqCst);
        self.queue.push(kf_id);
    }

    /// Newest keyframe ever enqueued.
    pub fn latest_enqueued(&self) -> Option<KeyFrameId> {
        match self.latest_enqueued.load(Ordering::SeqCst) {
            0 => None,
            v => Some(KeyFrameId::new(v - 1)),
        }
    }

    /// Non-blocking readiness check.
    pub fn is_batch_ready(&self) -> bool {
        self.is_enabled() && self.queue.len() >= self.batch_size
    }

    /// Block until a batch is ready, `finishing` becomes true, or `timeout`.
    pub fn wait_for_batch(&self, timeout: Duration, finishing: &AtomicBool) -> bool {
        let batch_size = self.batch_size;
        let enabled = &self.enabled;
        self.queue.wait_until(timeout, |len| {
            finishing.load(Ordering::SeqCst)
                || (enabled.load(Ordering::SeqCst) && len >= batch_size)
        });
        self.is_batch_ready()
    }

    pub fn wake_all(&self) {
        self.queue.wake_all();
    }

    /// Empty the queue and split it.
    ///
    /// Keyframes already marked semantic-ready by an earlier pass are pushed
    /// straight onto `tracking` and counted as processed; erased handles are
    /// dropped. The rest is returned, oldest first, as the next batch.
    pub fn drain_and_filter(
        &self,
        shared: &SharedState,
        tracking: &KeyFrameChannel,
        stats: &SemanticStats,
    ) -> Vec<KeyFrameId> {
        let drained = self.queue.drain();
        if drained.is_empty() {
            return drained;
        }

        let mut batch = Vec::with_capacity(drained.len());
        let mut ready = Vec::new();
        {
            let mut atlas = shared.atlas.write();
            for kf_id in drained {
                match atlas.keyframe_mut(kf_id) {
                    None => {
                        warn!("{} was erased while waiting for segmentation", kf_id);
                        stats.record_missing_keyframe();
                    }
                    Some(kf) if kf.is_semantic_ready() => {
                        kf.in_semantic_queue = false;
                        ready.push(kf_id);
                    }
                    Some(_) => batch.push(kf_id),
                }
            }
        }

        for kf_id in ready {
            debug!("{} already labeled, forwarding to semantic tracking", kf_id);
            stats.record_rerouted();
            tracking.push(kf_id);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use image::{GrayImage, RgbImage};

    use super::*;
    use crate::geometry::SE3;

    fn add_keyframes(shared: &SharedState, n: usize) -> Vec<KeyFrameId> {
        (0..n)
            .map(|i| {
                shared
                    .create_keyframe(i as u64, SE3::identity(), Arc::new(RgbImage::new(4, 4)), vec![])
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = SegmentationRequestQueue::new(2, true);
        for i in [5, 1, 9, 3] {
            queue.enqueue(KeyFrameId::new(i));
        }
        let drained: Vec<u64> = queue.queue.drain().into_iter().map(|id| id.0).collect();
        assert_eq!(drained, vec![5, 1, 9, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_channel_hand_off() {
        let channel = Arc::new(KeyFrameChannel::new("test"));
        assert_eq!(
            channel.recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                for i in [4, 2, 7] {
                    channel.push(KeyFrameId::new(i));
                }
            })
        };
        assert_eq!(
            channel.recv_timeout(Duration::from_secs(5)),
            Ok(KeyFrameId::new(4))
        );
        producer.join().unwrap();
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.pop(), Some(KeyFrameId::new(2)));
        assert_eq!(channel.drain(), vec![KeyFrameId::new(7)]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_batch_ready_threshold() {
        let queue = SegmentationRequestQueue::new(2, true);
        assert!(!queue.is_batch_ready());
        queue.enqueue(KeyFrameId::new(0));
        assert!(!queue.is_batch_ready());
        queue.enqueue(KeyFrameId::new(1));
        assert!(queue.is_batch_ready());
    }

    #[test]
    fn test_disabled_queue_never_ready() {
        let queue = SegmentationRequestQueue::new(1, false);
        for i in 0..5 {
            queue.enqueue(KeyFrameId::new(i));
        }
        assert!(!queue.is_batch_ready());
        queue.set_enabled(true);
        assert!(queue.is_batch_ready());
    }

    #[test]
    fn test_latest_enqueued() {
        let queue = SegmentationRequestQueue::new(2, true);
        assert_eq!(queue.latest_enqueued(), None);
        queue.enqueue(KeyFrameId::new(4));
        queue.enqueue(KeyFrameId::new(2));
        assert_eq!(queue.latest_enqueued(), Some(KeyFrameId::new(4)));
    }

    #[test]
    fn test_drain_reroutes_ready_keyframes() {
        let shared = SharedState::new();
        let ids = add_keyframes(&shared, 3);
        {
            let mut atlas = shared.atlas.write();
            let kf = atlas.keyframe_mut(ids[1]).unwrap();
            assert!(kf.apply_masks(GrayImage::new(4, 4), GrayImage::new(4, 4)));
        }

        let queue = SegmentationRequestQueue::new(2, true);
        let tracking = KeyFrameChannel::new("tracking");
        let stats = SemanticStats::default();
        for &id in &ids {
            queue.enqueue(id);
        }

        let batch = queue.drain_and_filter(&shared, &tracking, &stats);
        assert_eq!(batch, vec![ids[0], ids[2]]);
        assert_eq!(tracking.drain(), vec![ids[1]]);
        assert_eq!(stats.summary().rerouted, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_drops_erased_keyframes() {
        let shared = SharedState::new();
        let ids = add_keyframes(&shared, 2);
        assert!(shared.erase_keyframe(ids[0]));

        let queue = SegmentationRequestQueue::new(2, true);
        let tracking = KeyFrameChannel::new("tracking");
        let stats = SemanticStats::default();
        queue.enqueue(ids[0]);
        queue.enqueue(ids[1]);

        let batch = queue.drain_and_filter(&shared, &tracking, &stats);
        assert_eq!(batch, vec![ids[1]]);
        assert!(tracking.is_empty());
        assert_eq!(stats.summary().missing_keyframes, 1);
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let queue = Arc::new(KeyFrameQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(KeyFrameId::new(1));
            })
        };

        let start = Instant::now();
        let mut ready = false;
        while !ready && start.elapsed() < Duration::from_secs(5) {
            ready = queue.wait_until(Duration::from_secs(1), |len| len > 0);
        }
        producer.join().unwrap();
        assert!(ready);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_for_batch_returns_on_finish() {
        let queue = Arc::new(SegmentationRequestQueue::new(2, true));
        let finishing = Arc::new(AtomicBool::new(false));
        let waker = {
            let queue = Arc::clone(&queue);
            let finishing = Arc::clone(&finishing);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                finishing.store(true, Ordering::SeqCst);
                queue.wake_all();
            })
        };

        let start = Instant::now();
        while !finishing.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            assert!(!queue.wait_for_batch(Duration::from_secs(1), &finishing));
        }
        waker.join().unwrap();
        assert!(finishing.load(Ordering::SeqCst));
    }
}

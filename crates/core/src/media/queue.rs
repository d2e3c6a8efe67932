use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::extractor::{Format, SampleQueue, SampleQueueAllocator, TrackOutput};
use super::track::TrackType;

/// Default number of samples a [`BufferedSampleQueue`] holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub time_us: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub samples: u64,
    pub bytes: u64,
    /// Samples evicted unread because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct State {
    format: Option<Format>,
    pending: Vec<u8>,
    samples: VecDeque<Sample>,
    /// Index of the next sample [`BufferedSampleQueue::pop`] returns.
    read: usize,
    largest_us: Option<i64>,
    stats: QueueStats,
}

/// Bounded in-memory sample queue.
///
/// When full, the oldest sample is evicted.
#[derive(Debug)]
pub struct BufferedSampleQueue {
    track_id: u32,
    track_type: TrackType,
    capacity: usize,
    state: Mutex<State>,
}

impl BufferedSampleQueue {
    pub fn new(track_id: u32, track_type: TrackType, capacity: usize) -> Self {
        BufferedSampleQueue {
            track_id,
            track_type,
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
        }
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    /// Next unread sample.
    pub fn pop(&self) -> Option<Sample> {
        let mut state = self.state.lock();
        let sample = state.samples.get(state.read).cloned()?;
        state.read += 1;
        Some(sample)
    }

    /// Unread samples.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.samples.len() - state.read
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}

impl TrackOutput for BufferedSampleQueue {
    fn format(&self, format: Format) {
        self.state.lock().format = Some(format);
    }

    fn sample_data(&self, data: &[u8]) {
        self.state.lock().pending.extend_from_slice(data);
    }

    fn sample_metadata(&self, time_us: i64, keyframe: bool, size: usize) {
        let mut state = self.state.lock();
        let start = state.pending.len().saturating_sub(size);
        let data = state.pending.split_off(start);
        state.pending.clear();

        state.stats.samples += 1;
        state.stats.bytes += data.len() as u64;
        state.largest_us = Some(state.largest_us.map_or(time_us, |t| t.max(time_us)));
        state.samples.push_back(Sample {
            time_us,
            keyframe,
            data,
        });

        if state.samples.len() > self.capacity {
            state.samples.pop_front();
            if state.read > 0 {
                state.read -= 1;
            } else {
                state.stats.dropped += 1;
            }
        }
    }
}

impl SampleQueue for BufferedSampleQueue {
    fn upstream_format(&self) -> Option<Format> {
        self.state.lock().format.clone()
    }

    fn largest_queued_timestamp_us(&self) -> i64 {
        self.state.lock().largest_us.unwrap_or(i64::MIN)
    }

    fn seek_to(&self, time_us: i64, allow_time_beyond_buffer: bool) -> bool {
        let mut state = self.state.lock();
        let (Some(first), Some(largest)) = (state.samples.front(), state.largest_us) else {
            return false;
        };
        if time_us < first.time_us || (time_us > largest && !allow_time_beyond_buffer) {
            return false;
        }

        let target = state
            .samples
            .iter()
            .rposition(|s| s.keyframe && s.time_us <= time_us);
        match target {
            Some(index) => {
                state.read = index;
                true
            }
            None => false,
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.pending.clear();
        state.read = 0;
        state.largest_us = None;
    }

    fn discard_to(&self, time_us: i64, to_keyframe: bool) {
        let mut state = self.state.lock();
        let mut count = state
            .samples
            .iter()
            .take(state.read)
            .take_while(|s| s.time_us < time_us)
            .count();
        // Keep the keyframe decoding would restart from.
        if to_keyframe && !state.samples.get(count).is_some_and(|s| s.keyframe) {
            count = state
                .samples
                .iter()
                .take(count)
                .rposition(|s| s.keyframe)
                .unwrap_or(0);
        }
        state.samples.drain(..count);
        state.read -= count;
    }

    fn discard_to_end(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.read = 0;
    }

    fn is_ready(&self, loading_finished: bool) -> bool {
        loading_finished || !self.is_empty()
    }
}

/// Creates [`BufferedSampleQueue`]s and keeps a handle to each one so the
/// caller can drain them.
#[derive(Debug)]
pub struct BufferedQueueAllocator {
    capacity: usize,
    created: Mutex<Vec<Arc<BufferedSampleQueue>>>,
}

impl Default for BufferedQueueAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl BufferedQueueAllocator {
    pub fn new(capacity: usize) -> Self {
        BufferedQueueAllocator {
            capacity,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn queues(&self) -> Vec<Arc<BufferedSampleQueue>> {
        self.created.lock().clone()
    }
}

impl SampleQueueAllocator for BufferedQueueAllocator {
    fn create(&self, track_id: u32, track_type: TrackType) -> Arc<dyn SampleQueue> {
        let queue = Arc::new(BufferedSampleQueue::new(track_id, track_type, self.capacity));
        self.created.lock().push(queue.clone());
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &BufferedSampleQueue, time_us: i64, keyframe: bool) {
        queue.sample_data(&time_us.to_be_bytes());
        queue.sample_metadata(time_us, keyframe, 8);
    }

    #[test]
    fn samples_come_out_in_order() {
        let queue = BufferedSampleQueue::new(0, TrackType::Video, 8);
        push(&queue, 0, true);
        push(&queue, 40_000, false);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.largest_queued_timestamp_us(), 40_000);
        assert_eq!(queue.pop().unwrap().time_us, 0);
        assert_eq!(queue.pop().unwrap().data, 40_000i64.to_be_bytes());
        assert!(queue.pop().is_none());
        assert_eq!(queue.stats().samples, 2);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = BufferedSampleQueue::new(0, TrackType::Audio, 2);
        for t in 0..3 {
            push(&queue, t, true);
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.pop().unwrap().time_us, 1);
    }

    #[test]
    fn seek_inside_buffer_lands_on_keyframe() {
        let queue = BufferedSampleQueue::new(0, TrackType::Video, 16);
        push(&queue, 0, true);
        push(&queue, 100, false);
        push(&queue, 200, true);
        push(&queue, 300, false);

        assert!(queue.seek_to(250, false));
        assert_eq!(queue.pop().unwrap().time_us, 200);

        assert!(!queue.seek_to(1_000, false));
        assert!(!queue.seek_to(-5, false));
    }

    #[test]
    fn discard_keeps_preceding_keyframe() {
        let queue = BufferedSampleQueue::new(0, TrackType::Video, 16);
        push(&queue, 0, true);
        push(&queue, 100, false);
        push(&queue, 200, false);
        while queue.pop().is_some() {}

        queue.discard_to(150, true);
        assert!(queue.seek_to(0, false));
        while queue.pop().is_some() {}

        queue.discard_to(150, false);
        assert!(!queue.seek_to(0, false));
        assert_eq!(queue.largest_queued_timestamp_us(), 200);
    }

    #[test]
    fn empty_queue_cannot_seek() {
        let queue = BufferedSampleQueue::new(0, TrackType::Video, 16);
        assert!(!queue.seek_to(0, true));
        assert_eq!(queue.largest_queued_timestamp_us(), i64::MIN);
    }

    #[test]
    fn reset_keeps_format() {
        let queue = BufferedSampleQueue::new(0, TrackType::Video, 16);
        queue.format(Format {
            sample_mime_type: Some("video/avc".into()),
            ..Default::default()
        });
        push(&queue, 0, true);
        queue.reset();

        assert!(queue.is_empty());
        assert!(queue.upstream_format().is_some());
        assert!(!queue.is_ready(false));
        assert!(queue.is_ready(true));
    }

    #[test]
    fn allocator_tracks_created_queues() {
        let allocator = BufferedQueueAllocator::new(4);
        allocator.create(0, TrackType::Video);
        allocator.create(1, TrackType::Audio);
        let queues = allocator.queues();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[1].track_type(), TrackType::Audio);
    }
}

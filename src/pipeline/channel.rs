//! Single-slot, overwrite-only channels
//!
//! A channel holds only the most recently published value. Publishing never
//! waits on readers; readers that fall behind simply see the newest value.
//! The storage backend is picked at construction: an in-process atomic swap
//! or a memory-mapped record shared with other processes.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;
use crate::detection::Detection;
use crate::error::ChannelError;
use crate::pipeline::shm::MmapSlot;
use crate::{ChannelBackendKind, ChannelConfig};

/// Value that can live in a channel slot.
///
/// The byte encoding is what the shared-memory backend stores; the
/// in-process backend only uses `encoded_len` to enforce the slot capacity.
pub trait Record: Clone + Send + Sync + 'static {
    /// Tag written into shared slot headers so readers can't attach to the
    /// wrong kind of slot.
    const KIND: u16;

    fn encoded_len(&self) -> usize;

    /// Write the record into `buf`, which holds at least `encoded_len` bytes.
    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Result<Self, ChannelError>;
}

/// A value together with the channel sequence it was published under.
#[derive(Debug, Clone, PartialEq)]
pub struct Published<T> {
    pub sequence: u64,
    pub value: T,
}

/// Storage behind a [`Channel`].
pub trait SlotBackend<T>: Send + Sync {
    /// Replace the stored value; returns the new channel sequence. On error
    /// the previous value is still in place.
    fn publish(&self, value: T) -> Result<u64, ChannelError>;

    fn latest(&self) -> Option<Published<T>>;

    fn kind(&self) -> &'static str;
}

/// In-process backend: readers load an `Arc` without locking, writers are
/// serialised so sequence order matches store order.
pub struct InProcessSlot<T> {
    slot: ArcSwapOption<Published<T>>,
    writer: Mutex<u64>,
    capacity: Option<usize>,
}

impl<T> InProcessSlot<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            writer: Mutex::new(0),
            capacity,
        }
    }
}

impl<T: Record> SlotBackend<T> for InProcessSlot<T> {
    fn publish(&self, value: T) -> Result<u64, ChannelError> {
        let len = value.encoded_len();
        if let Some(capacity) = self.capacity {
            if len > capacity {
                return Err(ChannelError::PayloadTooLarge { len, capacity });
            }
        }

        let mut sequence = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let next = *sequence + 1;
        self.slot.store(Some(Arc::new(Published {
            sequence: next,
            value,
        })));
        *sequence = next;
        Ok(next)
    }

    fn latest(&self) -> Option<Published<T>> {
        self.slot.load_full().map(|published| (*published).clone())
    }

    fn kind(&self) -> &'static str {
        "in-process"
    }
}

#[derive(Default)]
struct Stats {
    published: AtomicUsize,
    rejected: AtomicUsize,
    reads: AtomicUsize,
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub published: usize,
    pub rejected: usize,
    pub reads: usize,
}

/// Single-slot channel over a selectable backend
pub struct Channel<T: Record> {
    backend: Box<dyn SlotBackend<T>>,
    stats: CachePadded<Stats>,
}

pub type FrameChannel = Channel<Frame>;
pub type DetectionChannel = Channel<Detection>;

impl<T: Record> Channel<T> {
    pub fn with_backend(backend: Box<dyn SlotBackend<T>>) -> Self {
        Self {
            backend,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// In-process channel; `capacity` bounds the encoded record size.
    pub fn in_process(capacity: Option<usize>) -> Self {
        Self::with_backend(Box::new(InProcessSlot::new(capacity)))
    }

    /// Create (or truncate) a shared slot file and publish into it.
    pub fn create_shared(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ChannelError> {
        Ok(Self::with_backend(Box::new(MmapSlot::<T>::create(
            path, capacity,
        )?)))
    }

    /// Attach to a slot file created by another process.
    pub fn open_shared(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        Ok(Self::with_backend(Box::new(MmapSlot::<T>::open(path)?)))
    }

    fn from_config(config: &ChannelConfig, file: &str, capacity: usize) -> Result<Self, ChannelError> {
        match config.backend {
            ChannelBackendKind::InProcess => Ok(Self::in_process(Some(capacity))),
            ChannelBackendKind::SharedMemory => {
                Self::create_shared(config.shm_dir.join(file), capacity)
            }
        }
    }

    /// Replace the stored value. A rejected publish leaves the previous
    /// value readable and is reported to the caller.
    pub fn publish(&self, value: T) -> Result<u64, ChannelError> {
        match self.backend.publish(value) {
            Ok(sequence) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(sequence)
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Most recently published value, `None` before the first publish.
    pub fn latest(&self) -> Option<Published<T>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.backend.latest()
    }

    /// Sequence of the newest value, 0 when empty.
    pub fn latest_sequence(&self) -> u64 {
        self.latest().map(|p| p.sequence).unwrap_or(0)
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            published: self.stats.published.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            reads: self.stats.reads.load(Ordering::Relaxed),
        }
    }
}

impl Channel<Frame> {
    pub fn frames(config: &ChannelConfig) -> Result<Self, ChannelError> {
        Self::from_config(
            config,
            "petcam_frames.slot",
            Frame::encoded_capacity(config.frame_capacity),
        )
    }
}

impl Channel<Detection> {
    pub fn detections(config: &ChannelConfig) -> Result<Self, ChannelError> {
        Self::from_config(
            config,
            "petcam_detections.slot",
            Detection::encoded_capacity(config.max_detections),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::capture::{CameraMode, PixelFormat, RawFrame};

    /// Every byte of the payload repeats the low bits of `n`, so a torn copy
    /// shows up as mixed bytes or a mismatch with the metadata.
    fn patterned_frame(n: u64, len: usize) -> Frame {
        let raw = RawFrame {
            data: Bytes::from(vec![(n % 251) as u8; len]),
            width: len as u32,
            height: 1,
            format: PixelFormat::Gray8,
            device_timestamp: None,
        };
        Frame::from_raw(raw, CameraMode::Day, n)
    }

    fn assert_untorn(frame: &Frame) {
        let expected = (frame.meta.sequence % 251) as u8;
        assert_eq!(frame.data.len(), frame.meta.width as usize);
        assert!(
            frame.data.iter().all(|&b| b == expected),
            "torn frame for source sequence {}",
            frame.meta.sequence
        );
    }

    fn hammer(channel: Arc<FrameChannel>, writes: u64, readers: usize) {
        let reader_handles: Vec<_> = (0..readers)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    let mut last = 0;
                    let mut observed = 0usize;
                    loop {
                        if let Some(published) = channel.latest() {
                            assert!(published.sequence >= last, "sequence went backwards");
                            assert_eq!(published.sequence, published.value.meta.sequence);
                            assert_untorn(&published.value);
                            last = published.sequence;
                            observed += 1;
                            if last == writes {
                                return observed;
                            }
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for n in 1..=writes {
            let len = 64 + (n as usize * 37) % 900;
            assert_eq!(channel.publish(patterned_frame(n, len)).unwrap(), n);
        }

        for handle in reader_handles {
            assert!(handle.join().unwrap() > 0);
        }
    }

    #[test]
    fn empty_channel_has_nothing() {
        let channel = FrameChannel::in_process(None);
        assert!(channel.latest().is_none());
        assert_eq!(channel.latest_sequence(), 0);
    }

    #[test]
    fn latest_returns_newest_publish_only() {
        let channel = FrameChannel::in_process(None);
        for n in 1..=3 {
            channel.publish(patterned_frame(n, 16)).unwrap();
        }
        let latest = channel.latest().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.value.meta.sequence, 3);
        assert_eq!(channel.stats().published, 3);
    }

    #[test]
    fn oversized_publish_is_rejected_and_prior_value_kept() {
        let channel = FrameChannel::in_process(Some(256));
        channel.publish(patterned_frame(1, 32)).unwrap();

        let err = channel.publish(patterned_frame(2, 4096)).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadTooLarge { .. }));

        let latest = channel.latest().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_untorn(&latest.value);
        assert_eq!(channel.stats().rejected, 1);
    }

    #[test]
    fn concurrent_readers_see_monotonic_untorn_frames_in_process() {
        hammer(Arc::new(FrameChannel::in_process(None)), 2_000, 4);
    }

    #[test]
    fn concurrent_readers_see_monotonic_untorn_frames_shared() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FrameChannel::create_shared(dir.path().join("frames.slot"), 4096).unwrap();
        hammer(Arc::new(channel), 2_000, 4);
    }

    #[test]
    fn second_mapping_sees_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.slot");
        let writer = FrameChannel::create_shared(&path, 1024).unwrap();
        let reader = FrameChannel::open_shared(&path).unwrap();

        assert!(reader.latest().is_none());
        writer.publish(patterned_frame(9, 100)).unwrap();
        thread::sleep(Duration::from_millis(1));

        let seen = reader.latest().unwrap();
        assert_eq!(seen.sequence, 1);
        assert_eq!(seen.value.meta.sequence, 9);
        assert_untorn(&seen.value);
    }

    #[test]
    fn detection_slot_rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.slot");
        let _frames = FrameChannel::create_shared(&path, 1024).unwrap();
        assert!(matches!(
            DetectionChannel::open_shared(&path),
            Err(ChannelError::Incompatible(_))
        ));
    }
}

//! Memory-mapped single-slot backend
//!
//! The slot is a file (normally under `/dev/shm`) holding a fixed 64-byte
//! header followed by one record of at most `capacity` bytes:
//!
//! ```text
//!  0  magic        u32   "PCS1"
//!  4  version      u16
//!  6  kind         u16   Record::KIND
//!  8  capacity     u64   payload bytes
//! 16  generation   u64   even = stable, odd = write in progress, 0 = empty
//! 24  sequence     u64   channel sequence of the stored record
//! 32  payload_len  u64
//! 64  payload
//! ```
//!
//! Readers copy the record out and accept it only if the generation was even
//! and unchanged across the copy. One writer per slot.

use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes};
use memmap2::MmapMut;
use tracing::warn;

use crate::capture::{CameraMode, Frame, FrameMetadata, PixelFormat};
use crate::detection::{BoundingBox, Detection};
use crate::error::ChannelError;
use crate::pipeline::channel::{Published, Record, SlotBackend};

const MAGIC: u32 = u32::from_le_bytes(*b"PCS1");
const VERSION: u16 = 1;
const HEADER_LEN: usize = 64;
const GENERATION_OFFSET: usize = 16;
const SEQUENCE_OFFSET: usize = 24;
const PAYLOAD_LEN_OFFSET: usize = 32;
const READ_ATTEMPTS: usize = 1_000;

/// Shared-memory slot for one record type
pub struct MmapSlot<T> {
    _map: MmapMut,
    base: *mut u8,
    capacity: usize,
    path: PathBuf,
    writer: Mutex<u64>,
    _record: PhantomData<fn() -> T>,
}

// SAFETY: `base` points into `_map`, which lives as long as the slot. The
// header is only touched through atomics, payload writes are serialised by
// `writer`, and readers validate every copy against the generation counter.
unsafe impl<T> Send for MmapSlot<T> {}
unsafe impl<T> Sync for MmapSlot<T> {}

impl<T: Record> MmapSlot<T> {
    /// Create or truncate the slot file.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((HEADER_LEN + capacity) as u64)?;

        // SAFETY: the file was just truncated and sized by us; other
        // processes only attach through `open`, which honours the protocol.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let mut header = &mut map[..HEADER_LEN];
        header.put_u32_le(MAGIC);
        header.put_u16_le(VERSION);
        header.put_u16_le(T::KIND);
        header.put_u64_le(capacity as u64);
        map.flush()?;

        Ok(Self::from_map(map, capacity, path, 0))
    }

    /// Attach to an existing slot file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the header is validated below before any record access.
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < HEADER_LEN {
            return Err(ChannelError::Incompatible(format!(
                "{} is {} bytes, shorter than the slot header",
                path.display(),
                map.len()
            )));
        }

        let mut header = &map[..HEADER_LEN];
        let magic = header.get_u32_le();
        let version = header.get_u16_le();
        let kind = header.get_u16_le();
        let capacity = header.get_u64_le() as usize;

        if magic != MAGIC || version != VERSION {
            return Err(ChannelError::Incompatible(format!(
                "{} is not a v{} slot file",
                path.display(),
                VERSION
            )));
        }
        if kind != T::KIND {
            return Err(ChannelError::Incompatible(format!(
                "{} holds record kind {}, expected {}",
                path.display(),
                kind,
                T::KIND
            )));
        }
        if HEADER_LEN + capacity > map.len() {
            return Err(ChannelError::Incompatible(format!(
                "{} declares {} payload bytes but maps only {}",
                path.display(),
                capacity,
                map.len() - HEADER_LEN
            )));
        }

        let mut slot = Self::from_map(map, capacity, path, 0);
        // SAFETY: in bounds of the validated header.
        let stored = unsafe { std::ptr::read_volatile(slot.field(SEQUENCE_OFFSET)) };
        slot.writer = Mutex::new(stored);
        Ok(slot)
    }

    fn from_map(mut map: MmapMut, capacity: usize, path: &Path, sequence: u64) -> Self {
        let base = map.as_mut_ptr();
        Self {
            _map: map,
            base,
            capacity,
            path: path.to_path_buf(),
            writer: Mutex::new(sequence),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn generation(&self) -> &AtomicU64 {
        // SAFETY: mmap is page aligned, so offset 16 is 8-byte aligned and
        // lies inside the header.
        unsafe { &*(self.base.add(GENERATION_OFFSET) as *const AtomicU64) }
    }

    fn field(&self, offset: usize) -> *mut u64 {
        // SAFETY: callers pass header offsets below HEADER_LEN.
        unsafe { self.base.add(offset) as *mut u64 }
    }

    fn payload(&self) -> *mut u8 {
        // SAFETY: the mapping is HEADER_LEN + capacity bytes long.
        unsafe { self.base.add(HEADER_LEN) }
    }
}

impl<T: Record> SlotBackend<T> for MmapSlot<T> {
    fn publish(&self, value: T) -> Result<u64, ChannelError> {
        let len = value.encoded_len();
        if len > self.capacity {
            return Err(ChannelError::PayloadTooLarge {
                len,
                capacity: self.capacity,
            });
        }

        let mut sequence = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let next = *sequence + 1;
        let generation = self.generation();
        // Odd while the record is being rewritten
        let busy = generation.load(Ordering::Relaxed) | 1;

        generation.store(busy, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: single writer under `self.writer`; `len <= capacity`.
        unsafe {
            std::ptr::write_volatile(self.field(SEQUENCE_OFFSET), next);
            std::ptr::write_volatile(self.field(PAYLOAD_LEN_OFFSET), len as u64);
            let payload = std::slice::from_raw_parts_mut(self.payload(), len);
            value.encode(payload);
        }
        generation.store(busy.wrapping_add(1), Ordering::Release);

        *sequence = next;
        Ok(next)
    }

    fn latest(&self) -> Option<Published<T>> {
        let generation = self.generation();

        for attempt in 0..READ_ATTEMPTS {
            let before = generation.load(Ordering::Acquire);
            if before == 0 {
                return None;
            }
            if before & 1 == 1 {
                backoff(attempt);
                continue;
            }

            // SAFETY: header offsets are in bounds; the copy is validated
            // against the generation before it is trusted.
            let (sequence, len) = unsafe {
                (
                    std::ptr::read_volatile(self.field(SEQUENCE_OFFSET)),
                    std::ptr::read_volatile(self.field(PAYLOAD_LEN_OFFSET)) as usize,
                )
            };
            if len > self.capacity {
                backoff(attempt);
                continue;
            }

            let mut copy = Vec::new();
            if copy.try_reserve_exact(len).is_err() {
                warn!(len, path = %self.path.display(), "no memory for slot read");
                return None;
            }
            // SAFETY: `len <= capacity` and `copy` has room for `len` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(self.payload(), copy.as_mut_ptr(), len);
                copy.set_len(len);
            }
            fence(Ordering::Acquire);

            if generation.load(Ordering::Relaxed) != before {
                backoff(attempt);
                continue;
            }

            return match T::decode(&copy) {
                Ok(value) => Some(Published { sequence, value }),
                Err(e) => {
                    warn!(path = %self.path.display(), "dropping undecodable slot record: {}", e);
                    None
                }
            };
        }

        None
    }

    fn kind(&self) -> &'static str {
        "shared-memory"
    }
}

fn backoff(attempt: usize) {
    if attempt < 16 {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

fn to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

const NO_DEVICE_TIMESTAMP: u64 = u64::MAX;
const FRAME_HEADER_LEN: usize = 40;

impl Frame {
    /// Encoded size of a frame carrying `pixel_bytes` bytes of image data.
    pub fn encoded_capacity(pixel_bytes: usize) -> usize {
        FRAME_HEADER_LEN + pixel_bytes
    }
}

impl Record for Frame {
    const KIND: u16 = 1;

    fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.data.len()
    }

    fn encode(&self, mut buf: &mut [u8]) {
        let meta = &self.meta;
        buf.put_u64_le(meta.sequence);
        buf.put_u64_le(to_nanos(self.timestamp));
        buf.put_u64_le(
            meta.device_timestamp
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(NO_DEVICE_TIMESTAMP),
        );
        buf.put_u32_le(meta.width);
        buf.put_u32_le(meta.height);
        buf.put_u8(meta.camera.index() as u8);
        buf.put_u8(meta.format.to_wire());
        buf.put_u16_le(0);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    fn decode(mut buf: &[u8]) -> Result<Self, ChannelError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ChannelError::Corrupt(format!(
                "frame record of {} bytes",
                buf.len()
            )));
        }
        let sequence = buf.get_u64_le();
        let timestamp = from_nanos(buf.get_u64_le());
        let device = buf.get_u64_le();
        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let camera = CameraMode::from_index(buf.get_u8())
            .ok_or_else(|| ChannelError::Corrupt("unknown camera".into()))?;
        let format = PixelFormat::from_wire(buf.get_u8())
            .ok_or_else(|| ChannelError::Corrupt("unknown pixel format".into()))?;
        buf.advance(2);
        let data_len = buf.get_u32_le() as usize;
        if data_len > buf.remaining() {
            return Err(ChannelError::Corrupt(format!(
                "frame claims {} data bytes, {} present",
                data_len,
                buf.remaining()
            )));
        }

        Ok(Frame {
            data: Bytes::copy_from_slice(&buf[..data_len]),
            meta: std::sync::Arc::new(FrameMetadata {
                sequence,
                camera,
                width,
                height,
                format,
                device_timestamp: (device != NO_DEVICE_TIMESTAMP)
                    .then(|| Duration::from_nanos(device)),
            }),
            timestamp,
        })
    }
}

const DETECTION_HEADER_LEN: usize = 24;
const BOX_LEN: usize = 24;

impl Detection {
    /// Encoded size of a detection carrying `boxes` boxes.
    pub fn encoded_capacity(boxes: usize) -> usize {
        DETECTION_HEADER_LEN + boxes * BOX_LEN
    }
}

impl Record for Detection {
    const KIND: u16 = 2;

    fn encoded_len(&self) -> usize {
        Detection::encoded_capacity(self.boxes.len())
    }

    fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u64_le(to_nanos(self.timestamp));
        buf.put_u64_le(self.frame_sequence);
        buf.put_u32_le(self.boxes.len() as u32);
        buf.put_u32_le(0);
        for b in &self.boxes {
            buf.put_u32_le(b.class_id);
            buf.put_f32_le(b.confidence);
            buf.put_i32_le(b.x);
            buf.put_i32_le(b.y);
            buf.put_i32_le(b.w);
            buf.put_i32_le(b.h);
        }
    }

    fn decode(mut buf: &[u8]) -> Result<Self, ChannelError> {
        if buf.len() < DETECTION_HEADER_LEN {
            return Err(ChannelError::Corrupt(format!(
                "detection record of {} bytes",
                buf.len()
            )));
        }
        let timestamp = from_nanos(buf.get_u64_le());
        let frame_sequence = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        buf.advance(4);
        if count * BOX_LEN > buf.remaining() {
            return Err(ChannelError::Corrupt(format!(
                "detection claims {} boxes in {} bytes",
                count,
                buf.remaining()
            )));
        }

        let boxes = (0..count)
            .map(|_| BoundingBox {
                class_id: buf.get_u32_le(),
                confidence: buf.get_f32_le(),
                x: buf.get_i32_le(),
                y: buf.get_i32_le(),
                w: buf.get_i32_le(),
                h: buf.get_i32_le(),
            })
            .collect();

        Ok(Detection {
            boxes,
            timestamp,
            frame_sequence,
        })
    }
}

//! Raw frame model, buffer leases and the frame pool.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

/// Pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, one plane.
    Rgb8,
    /// Packed 8-bit RGBA, one plane. Alpha is discarded.
    Rgba8,
    /// 8-bit grayscale, one plane (native IR camera output).
    Gray8,
    /// Packed YUYV 4:2:2, one plane: `[Y0, U, Y1, V]` per pixel pair.
    Yuyv,
    /// Semi-planar YUV 4:2:0: a Y plane and an interleaved `VU` plane.
    Nv21,
    /// YUV 4:2:0 in three planes (Y, U, V) with explicit row and pixel
    /// strides, as delivered by most camera stacks.
    Yuv420,
    /// A compressed still image (JPEG, PNG, ...) in one plane.
    Encoded,
}

impl PixelFormat {
    /// Number of planes this format is delivered in.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv21 => 2,
            PixelFormat::Yuv420 => 3,
            _ => 1,
        }
    }
}

/// Clockwise rotation that brings the frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported rotation: {0} degrees")]
pub struct InvalidRotation(pub i32);

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Result<Self, InvalidRotation> {
        match degrees.rem_euclid(360) {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            _ => Err(InvalidRotation(degrees)),
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// One plane of pixel data.
#[derive(Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of consecutive rows.
    pub row_stride: usize,
    /// Bytes between consecutive samples within a row.
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self { data, row_stride, pixel_stride }
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("len", &self.data.len())
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .finish()
    }
}

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A captured camera frame, or a still image wrapped as one.
#[derive(Debug, Clone)]
pub struct Frame {
    pub planes: Vec<Plane>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub timestamp: Instant,
    pub sequence: u64,
}

impl Frame {
    /// Frame with explicit planes.
    pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            planes,
            format,
            width,
            height,
            rotation: Rotation::Deg0,
            timestamp: Instant::now(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Single-plane frame with tightly packed rows.
    pub fn packed(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        let bytes_per_pixel = match format {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Yuyv => 2,
            _ => 1,
        };
        let plane = Plane::new(data, width as usize * bytes_per_pixel, bytes_per_pixel);
        Self::new(format, width, height, vec![plane])
    }

    /// Still image in a compressed container. Dimensions are known only
    /// after decoding and are reported as zero.
    pub fn encoded(data: Vec<u8>) -> Self {
        let len = data.len();
        Self::new(PixelFormat::Encoded, 0, 0, vec![Plane::new(data, len, 1)])
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Take the plane buffers back, e.g. for reuse by a pool.
    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        self.planes.into_iter().map(|p| p.data).collect()
    }
}

/// Reclaims frames once the consumer is done with them.
pub trait FrameRecycler: Send + Sync {
    fn recycle(&self, frame: Frame);
}

/// Exclusive loan of a frame from its source.
///
/// The frame goes back to the recycler exactly once: on [`FrameLease::release`]
/// or when the lease is dropped, whichever comes first.
pub struct FrameLease {
    frame: Option<Frame>,
    recycler: Arc<dyn FrameRecycler>,
}

impl FrameLease {
    pub fn new(frame: Frame, recycler: Arc<dyn FrameRecycler>) -> Self {
        Self { frame: Some(frame), recycler }
    }

    /// A lease whose frame is simply dropped on release.
    pub fn detached(frame: Frame) -> Self {
        Self::new(frame, Arc::new(DropRecycler))
    }

    pub fn frame(&self) -> &Frame {
        // Only `Drop` takes the frame out.
        self.frame.as_ref().unwrap_or_else(|| unreachable!("frame lease used after release"))
    }

    pub fn release(self) {}
}

impl std::ops::Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        self.frame()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.recycler.recycle(frame);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease").field("frame", &self.frame).finish()
    }
}

struct DropRecycler;

impl FrameRecycler for DropRecycler {
    fn recycle(&self, _frame: Frame) {}
}

/// Bounded pool of frame buffers shared between a source and its consumer.
///
/// At most `capacity` leases are outstanding; a source that cannot get a
/// buffer must skip the capture. Buffers of released frames are kept for
/// reuse.
pub struct FramePool {
    capacity: usize,
    outstanding: AtomicUsize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            outstanding: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of leases not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// A zeroed buffer of `len` bytes, reusing a released one when possible.
    pub fn buffer(&self, len: usize) -> Vec<u8> {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        let mut buf = reused.unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Lend `frame` to a consumer. Returns `None` when the pool is exhausted.
    pub fn lease(self: &Arc<Self>, frame: Frame) -> Option<FrameLease> {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                tracing::trace!(capacity = self.capacity, "frame pool exhausted");
                return None;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(FrameLease::new(frame, Arc::clone(self) as Arc<dyn FrameRecycler>))
    }
}

impl FrameRecycler for FramePool {
    fn recycle(&self, frame: Frame) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity * 3 {
                free.extend(frame.into_buffers());
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Receives frames from a source. Implementations must not block.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, lease: FrameLease);
}

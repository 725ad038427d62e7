//! V4L2 camera source via the `v4l` crate.

use crate::frame::{Frame, FramePool, FrameSink, PixelFormat, Rotation};
use crate::source::SourceHandle;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    rotation: Rotation,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and negotiate
    /// a YUYV or GREY capture format at the requested size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Gray8
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            rotation: Rotation::Deg0,
        })
    }

    /// Rotation to stamp on every captured frame (sensor mounting).
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    fn frame_len(&self) -> usize {
        let bytes_per_pixel = if self.pixel_format == PixelFormat::Yuyv { 2 } else { 1 };
        (self.width * self.height) as usize * bytes_per_pixel
    }

    /// Start streaming into `sink` on a dedicated thread.
    ///
    /// Each dequeued buffer is copied into a pool buffer so the driver's
    /// mmap ring is requeued immediately. Captures that find the pool empty
    /// are dropped.
    pub fn spawn(self, pool: Arc<FramePool>, sink: Arc<dyn FrameSink>) -> Result<SourceHandle, CameraError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("facewatch-camera".into())
            .spawn(move || {
                if let Err(e) = self.run(&pool, sink.as_ref(), &thread_stop) {
                    tracing::error!(error = %e, "camera capture stopped");
                }
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(SourceHandle::new(stop, thread))
    }

    fn run(&self, pool: &Arc<FramePool>, sink: &dyn FrameSink, stop: &AtomicBool) -> Result<(), CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let len = self.frame_len();
        while !stop.load(Ordering::SeqCst) {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

            if buf.len() < len {
                tracing::debug!(seq = meta.sequence, got = buf.len(), expected = len, "short buffer; skipping");
                continue;
            }

            let mut data = pool.buffer(len);
            data.copy_from_slice(&buf[..len]);
            let frame = Frame::packed(self.pixel_format, self.width, self.height, data)
                .with_rotation(self.rotation)
                .with_sequence(meta.sequence as u64);

            match pool.lease(frame) {
                Some(lease) => sink.deliver(lease),
                None => tracing::trace!(seq = meta.sequence, "no free frame buffer; dropping capture"),
            }
        }

        tracing::info!(device = %self.device_path, "camera capture stopped");
        Ok(())
    }
}

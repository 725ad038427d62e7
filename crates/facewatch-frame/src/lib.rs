//! facewatch-frame: raw frames, normalization and frame sources.
//!
//! Frames are lent to the pipeline through [`FrameLease`]s and returned to
//! their [`FramePool`] exactly once. [`normalize`] turns any supported
//! layout into an upright RGB buffer.

#[cfg(feature = "v4l")]
pub mod camera;
pub mod frame;
pub mod normalize;
pub mod source;

#[cfg(feature = "v4l")]
pub use camera::{Camera, CameraError};
pub use frame::{Frame, FrameLease, FramePool, FrameRecycler, FrameSink, InvalidRotation, PixelFormat, Plane, Rotation};
pub use normalize::{normalize, NormalizeError};
pub use source::{read_still, ImageSequenceSource, SourceError, SourceHandle};

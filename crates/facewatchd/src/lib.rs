//! facewatchd: the real-time face-match pipeline.
//!
//! Frames are offered to the engine through a single-slot admission gate;
//! admitted frames are normalized, faces are located, embedded and compared
//! against the enrolled reference on a dedicated engine thread.

pub mod admission;
pub mod config;
pub mod dbus_interface;
pub mod engine;
pub mod events;
pub mod reference;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use config::{BusKind, Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle, EngineStatus, EnrollError, EnrollInput, Pipeline};
pub use events::{EnrollFailure, PipelineEvent};
pub use reference::{ReferenceSnapshot, ReferenceStore};

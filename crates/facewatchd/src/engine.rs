use crate::admission::{AdmissionGate, AdmissionPermit, AdmissionStats};
use crate::events::{EnrollFailure, PipelineEvent};
use crate::reference::ReferenceStore;
use chrono::{DateTime, Utc};
use facewatch_core::{
    crop_face, EmbedderError, EuclideanMatcher, FaceEmbedder, FaceLocator, LocatorError, MatchError,
};
use facewatch_frame::{normalize, read_still, Frame, FrameLease, FrameSink, NormalizeError, SourceError};
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no tokio runtime available for reference timers")]
    NoRuntime,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread panicked")]
    Panicked,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("failed to read still image: {0}")]
    Read(#[from] SourceError),
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("face localization failed: {0}")]
    Locator(#[from] LocatorError),
    #[error("no face found")]
    NoFace,
    #[error("expected one face, found {0}")]
    MultipleFaces(usize),
    #[error("face region lies outside the image")]
    CropRegionInvalid,
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EnrollError {
    /// Failure reported to the presentation layer. `None` when the engine is
    /// stopping or gone and nothing was attempted.
    pub fn kind(&self) -> Option<EnrollFailure> {
        Some(match self {
            EnrollError::Read(_) => EnrollFailure::Unreadable,
            EnrollError::Normalize(_) => EnrollFailure::Normalize,
            EnrollError::Locator(_) => EnrollFailure::Locator,
            EnrollError::NoFace => EnrollFailure::NoFace,
            EnrollError::MultipleFaces(_) => EnrollFailure::MultipleFaces,
            EnrollError::CropRegionInvalid => EnrollFailure::CropRegionInvalid,
            EnrollError::Embedding(_) => EnrollFailure::Embedding,
            EnrollError::ShuttingDown | EnrollError::ChannelClosed => return None,
        })
    }
}

/// Per-frame failures. Logged and absorbed; the frame is released either way.
#[derive(Error, Debug)]
enum FrameError {
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("face localization failed: {0}")]
    Locator(#[from] LocatorError),
}

/// The face-analysis collaborators, moved onto the engine thread.
pub struct Pipeline {
    pub locator: Box<dyn FaceLocator>,
    pub embedder: FaceEmbedder,
    pub matcher: EuclideanMatcher,
    pub reference_timeout: Duration,
}

/// Still image to enroll as the new reference.
#[derive(Debug)]
pub enum EnrollInput {
    Frame(Frame),
    File(PathBuf),
}

/// Snapshot of the pipeline for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub admission: AdmissionStats,
    pub frames_analyzed: u64,
    pub matches: u64,
    pub reference_armed: bool,
    pub reference_expires_at: Option<DateTime<Utc>>,
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Frame {
        lease: FrameLease,
        _permit: AdmissionPermit,
    },
    Enroll {
        input: EnrollInput,
        reply: oneshot::Sender<Result<(), EnrollError>>,
    },
    Shutdown,
}

#[derive(Default)]
struct Counters {
    analyzed: AtomicU64,
    matches: AtomicU64,
}

struct Shared {
    tx: mpsc::Sender<EngineRequest>,
    gate: Arc<AdmissionGate>,
    reference: Arc<ReferenceStore>,
    counters: Arc<Counters>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Offer a frame to the pipeline without blocking.
    ///
    /// The frame is analyzed only if no other frame is in flight; otherwise
    /// the lease is dropped here and the frame goes straight back to its
    /// source. Returns whether the frame was admitted.
    pub fn deliver(&self, lease: FrameLease) -> bool {
        let Some(permit) = self.shared.gate.try_acquire() else {
            tracing::trace!(seq = lease.sequence, "pipeline busy; frame dropped");
            return false;
        };
        let request = EngineRequest::Frame { lease, _permit: permit };
        match self.shared.tx.try_send(request) {
            Ok(()) => true,
            Err(_) => {
                // The returned request drops here, releasing lease and permit.
                tracing::debug!("engine not accepting frames; frame dropped");
                false
            }
        }
    }

    /// Enroll a still image as the reference.
    ///
    /// The outcome is also published as a `ReferenceEnrolled` event. A
    /// failed enrollment leaves the current reference untouched.
    pub async fn enroll_reference(&self, input: EnrollInput) -> Result<(), EnrollError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .tx
            .send(EngineRequest::Enroll { input, reply: reply_tx })
            .await
            .map_err(|_| EnrollError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EnrollError::ChannelClosed)?
    }

    pub fn status(&self) -> EngineStatus {
        let shared = &self.shared;
        EngineStatus {
            admission: shared.gate.stats(),
            frames_analyzed: shared.counters.analyzed.load(Ordering::Relaxed),
            matches: shared.counters.matches.load(Ordering::Relaxed),
            reference_armed: shared.reference.is_armed(),
            reference_expires_at: shared.reference.expires_at(),
        }
    }

    /// Stop admitting frames, cancel the reference timer, let in-flight
    /// work finish, unload the model and join the engine thread.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shared.gate.close();
        self.shared.reference.shutdown();

        if self.shared.tx.send(EngineRequest::Shutdown).await.is_err() {
            tracing::debug!("engine thread already stopped");
        }

        let thread = self.shared.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|_| EngineError::Panicked)?;
            joined.map_err(|_| EngineError::Panicked)?;
        }
        // Enrollments that raced the close may have armed a timer.
        self.shared.reference.shutdown();
        Ok(())
    }
}

impl FrameSink for EngineHandle {
    fn deliver(&self, lease: FrameLease) {
        EngineHandle::deliver(self, lease);
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Must be called from within a tokio runtime; reference expiry timers run
/// on it. Events are published on `events`.
pub fn spawn_engine(
    pipeline: Pipeline,
    events: mpsc::UnboundedSender<PipelineEvent>,
) -> Result<EngineHandle, EngineError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
    let reference = ReferenceStore::new(events.clone(), runtime);
    let gate = AdmissionGate::new();
    let counters = Arc::new(Counters::default());

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let mut worker = Worker {
        pipeline,
        reference: Arc::clone(&reference),
        gate: Arc::clone(&gate),
        events,
        counters: Arc::clone(&counters),
    };

    let thread = std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Frame { lease, _permit: permit } => {
                        worker.run_frame(lease.frame());
                        // Frame goes back to its source before the gate re-opens.
                        drop(lease);
                        drop(permit);
                    }
                    EngineRequest::Enroll { input, reply } => {
                        let result = worker.run_enroll(input);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Shutdown => break,
                }
            }
            worker.pipeline.embedder.unload();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        shared: Arc::new(Shared {
            tx,
            gate,
            reference,
            counters,
            thread: Mutex::new(Some(thread)),
        }),
    })
}

struct Worker {
    pipeline: Pipeline,
    reference: Arc<ReferenceStore>,
    gate: Arc<AdmissionGate>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    counters: Arc<Counters>,
}

impl Worker {
    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver gone; event dropped");
        }
    }

    fn run_frame(&mut self, frame: &Frame) {
        self.counters.analyzed.fetch_add(1, Ordering::Relaxed);
        match self.analyze(frame) {
            Ok(Some(distance)) => {
                self.counters.matches.fetch_add(1, Ordering::Relaxed);
                tracing::info!(seq = frame.sequence, distance, "face matched reference");
                self.emit(PipelineEvent::matched(distance));
            }
            Ok(None) => {}
            Err(FrameError::Normalize(e)) => {
                tracing::debug!(seq = frame.sequence, error = %e, "frame skipped")
            }
            Err(e) => tracing::warn!(seq = frame.sequence, error = %e, "frame analysis failed"),
        }
    }

    /// Compare every face in the frame against the reference until the
    /// first match. Returns the matching distance.
    fn analyze(&mut self, frame: &Frame) -> Result<Option<f32>, FrameError> {
        let image = normalize(frame)?;
        let faces = self.pipeline.locator.locate(&image)?;
        if faces.is_empty() {
            tracing::trace!(seq = frame.sequence, "no faces");
            return Ok(None);
        }

        let shape = self.pipeline.embedder.shape();
        for face in &faces {
            let Some(snapshot) = self.reference.snapshot() else {
                tracing::trace!(seq = frame.sequence, "no reference armed");
                return Ok(None);
            };

            let Some(crop) = crop_face(&image, face, shape.input_width, shape.input_height) else {
                tracing::debug!(seq = frame.sequence, ?face, "face region outside frame");
                continue;
            };

            let embedding = match self.pipeline.embedder.embed(&crop) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(seq = frame.sequence, error = %e, "embedding failed");
                    continue;
                }
            };

            let decision = match self.pipeline.matcher.compare(&embedding, &snapshot.embedding) {
                Ok(decision) => decision,
                Err(MatchError::LengthMismatch { left, right }) => {
                    tracing::warn!(left, right, "embedding length differs from reference");
                    continue;
                }
            };
            tracing::debug!(seq = frame.sequence, distance = decision.distance, matched = decision.matched, "compared");

            if decision.matched {
                // Only the comparison that clears the reference reports the match.
                if self.reference.clear_on_match(&snapshot) {
                    return Ok(Some(decision.distance));
                }
                // Replaced or expired meanwhile; later faces snapshot again.
                tracing::debug!(installation = snapshot.installation, "reference changed during comparison");
            }
        }
        Ok(None)
    }

    fn run_enroll(&mut self, input: EnrollInput) -> Result<(), EnrollError> {
        let result = self.enroll(input);
        match &result {
            Ok(()) => self.emit(PipelineEvent::enrolled(Ok(()))),
            Err(e) => {
                tracing::warn!(error = %e, "enrollment failed");
                if let Some(kind) = e.kind() {
                    self.emit(PipelineEvent::enrolled(Err(kind)));
                }
            }
        }
        result
    }

    fn enroll(&mut self, input: EnrollInput) -> Result<(), EnrollError> {
        if self.gate.is_closed() {
            return Err(EnrollError::ShuttingDown);
        }
        let frame = match input {
            EnrollInput::Frame(frame) => frame,
            EnrollInput::File(path) => read_still(&path)?,
        };
        let image = normalize(&frame)?;
        let crop = self.single_face(&image)?;
        let embedding = self.pipeline.embedder.embed(&crop)?;

        if self.gate.is_closed() {
            return Err(EnrollError::ShuttingDown);
        }
        let installation = self.reference.install(embedding, self.pipeline.reference_timeout);
        tracing::info!(installation, "reference enrolled");
        Ok(())
    }

    fn single_face(&mut self, image: &RgbImage) -> Result<RgbImage, EnrollError> {
        let faces = self.pipeline.locator.locate(image)?;
        let face = match faces.as_slice() {
            [] => return Err(EnrollError::NoFace),
            [face] => face,
            many => return Err(EnrollError::MultipleFaces(many.len())),
        };
        tracing::debug!(confidence = face.confidence, "enroll: face located");

        let shape = self.pipeline.embedder.shape();
        crop_face(image, face, shape.input_width, shape.input_height).ok_or(EnrollError::CropRegionInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BoundingBox, EmbedderShape, Embedding, EmbeddingModel};
    use facewatch_frame::{FramePool, PixelFormat};
    use ndarray::Array4;

    /// Finds one face covering the whole image.
    struct WholeImage;

    impl FaceLocator for WholeImage {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocatorError> {
            Ok(vec![BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32)])
        }
    }

    /// Embedding is the mean channel value repeated.
    struct Mean;

    impl EmbeddingModel for Mean {
        fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, EmbedderError> {
            let mean = input.mean().unwrap_or(0.0);
            Ok(vec![mean; 4])
        }
    }

    fn pipeline() -> Pipeline {
        let shape = EmbedderShape { input_width: 8, input_height: 8, embedding_len: 4 };
        Pipeline {
            locator: Box::new(WholeImage),
            embedder: FaceEmbedder::new(Box::new(Mean), shape),
            matcher: EuclideanMatcher::default(),
            reference_timeout: Duration::from_secs(5),
        }
    }

    fn gray(value: u8) -> Frame {
        Frame::packed(PixelFormat::Gray8, 16, 16, vec![value; 256])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enroll_then_match_clears_reference() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = spawn_engine(pipeline(), tx).unwrap();

        engine.enroll_reference(EnrollInput::Frame(gray(128))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PipelineEvent::ReferenceEnrolled { error: None, .. })));
        assert!(engine.status().reference_armed);

        let pool = FramePool::new(2);
        assert!(engine.deliver(pool.lease(gray(128)).unwrap()));

        match rx.recv().await {
            Some(PipelineEvent::Matched { distance, .. }) => assert_eq!(distance, 0.0),
            other => panic!("expected match, got {other:?}"),
        }
        assert!(!engine.status().reference_armed);

        engine.shutdown().await.unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(engine.status().matches, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_refuses_frames_and_enrollment() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = spawn_engine(pipeline(), tx).unwrap();
        engine.shutdown().await.unwrap();

        let pool = FramePool::new(1);
        assert!(!engine.deliver(pool.lease(gray(10)).unwrap()));
        assert_eq!(pool.outstanding(), 0);

        let err = engine.enroll_reference(EnrollInput::Frame(gray(10))).await.unwrap_err();
        assert!(matches!(err, EnrollError::ChannelClosed));
        assert!(err.kind().is_none());
    }

    /// Finds two faces, both covering the whole image.
    struct TwoFaces;

    impl FaceLocator for TwoFaces {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocatorError> {
            let whole = BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32);
            Ok(vec![whole, whole])
        }
    }

    /// Mean model that re-enrolls the reference during its first inference,
    /// like an enrollment landing between snapshot and clear.
    struct ReenrollOnce {
        store: Arc<ReferenceStore>,
        done: bool,
    }

    impl EmbeddingModel for ReenrollOnce {
        fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, EmbedderError> {
            let mean = input.mean().unwrap_or(0.0);
            if !self.done {
                self.done = true;
                self.store.install(Embedding::new(vec![mean; 4]), Duration::from_secs(5));
            }
            Ok(vec![mean; 4])
        }
    }

    fn worker(
        locator: Box<dyn FaceLocator>,
        model: Box<dyn EmbeddingModel>,
        store: Arc<ReferenceStore>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Worker {
        let shape = EmbedderShape { input_width: 8, input_height: 8, embedding_len: 4 };
        Worker {
            pipeline: Pipeline {
                locator,
                embedder: FaceEmbedder::new(model, shape),
                matcher: EuclideanMatcher::default(),
                reference_timeout: Duration::from_secs(5),
            },
            reference: store,
            gate: AdmissionGate::new(),
            events,
            counters: Arc::new(Counters::default()),
        }
    }

    #[tokio::test]
    async fn test_later_face_matches_replaced_reference() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let store = ReferenceStore::new(tx.clone(), tokio::runtime::Handle::current());
        store.install(Embedding::new(vec![128.0 / 255.0; 4]), Duration::from_secs(5));

        let model = ReenrollOnce { store: Arc::clone(&store), done: false };
        let mut worker = worker(Box::new(TwoFaces), Box::new(model), Arc::clone(&store), tx);

        let distance = worker.analyze(&gray(128)).unwrap();
        assert!(distance.is_some_and(|d| d < 1e-3), "got {distance:?}");
        // The replacement was the one matched and cleared.
        assert!(store.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_enroll_refused_once_gate_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = ReferenceStore::new(tx.clone(), tokio::runtime::Handle::current());
        let mut worker = worker(Box::new(WholeImage), Box::new(Mean), Arc::clone(&store), tx);
        worker.gate.close();

        let err = worker.run_enroll(EnrollInput::Frame(gray(128))).unwrap_err();
        assert!(matches!(err, EnrollError::ShuttingDown));
        assert!(!store.is_armed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_outside_runtime() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(spawn_engine(pipeline(), tx), Err(EngineError::NoRuntime)));
    }

    #[test]
    fn test_enroll_error_kinds() {
        assert_eq!(EnrollError::NoFace.kind(), Some(EnrollFailure::NoFace));
        assert_eq!(EnrollError::MultipleFaces(3).kind(), Some(EnrollFailure::MultipleFaces));
        assert_eq!(EnrollError::CropRegionInvalid.kind(), Some(EnrollFailure::CropRegionInvalid));
        assert_eq!(
            EnrollError::Embedding(EmbedderError::ModelNotReady).kind(),
            Some(EnrollFailure::Embedding)
        );
    }
}

use crate::engine::{EngineHandle, EnrollInput};
use crate::events::PipelineEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facewatch.Pipeline1";
pub const OBJECT_PATH: &str = "/org/facewatch/Pipeline1";

/// D-Bus interface for the facewatch pipeline.
///
/// Bus name: org.facewatch.Pipeline1
/// Object path: /org/facewatch/Pipeline1
pub struct PipelineService {
    engine: EngineHandle,
    shutdown: Arc<Notify>,
}

impl PipelineService {
    /// `shutdown` is notified when a client calls `Shutdown()`.
    pub fn new(engine: EngineHandle, shutdown: Arc<Notify>) -> Self {
        Self { engine, shutdown }
    }
}

#[interface(name = "org.facewatch.Pipeline1")]
impl PipelineService {
    /// Enroll the face in the still image at `path` as the reference.
    ///
    /// The image must contain exactly one face. The outcome is also
    /// broadcast as `ReferenceEnrolled`.
    async fn enroll_reference(&self, path: &str) -> zbus::fdo::Result<()> {
        tracing::info!(path, "enroll requested");
        self.engine
            .enroll_reference(EnrollInput::File(PathBuf::from(path)))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return pipeline status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status();
        let mut json = serde_json::to_value(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        json["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(json.to_string())
    }

    /// Stop the daemon.
    async fn shutdown(&self) -> zbus::fdo::Result<()> {
        tracing::info!("shutdown requested over D-Bus");
        self.shutdown.notify_one();
        Ok(())
    }

    /// A live face matched the reference; the reference is now cleared.
    #[zbus(signal)]
    async fn matched(emitter: &SignalEmitter<'_>, distance: f64) -> zbus::Result<()>;

    /// Outcome of an enrollment; `error` is empty when `ok` is true.
    #[zbus(signal)]
    async fn reference_enrolled(emitter: &SignalEmitter<'_>, ok: bool, error: &str) -> zbus::Result<()>;

    /// The reference timed out before any match.
    #[zbus(signal)]
    async fn reference_expired(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

/// Publish pipeline events as D-Bus signals until the event channel closes.
pub async fn forward_events(
    conn: zbus::Connection,
    mut events: mpsc::UnboundedReceiver<PipelineEvent>,
) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    while let Some(event) = events.recv().await {
        let sent = match &event {
            PipelineEvent::Matched { distance, .. } => PipelineService::matched(&emitter, f64::from(*distance)).await,
            PipelineEvent::ReferenceEnrolled { error, .. } => {
                let reason = error.map(|e| e.as_str()).unwrap_or("");
                PipelineService::reference_enrolled(&emitter, error.is_none(), reason).await
            }
            PipelineEvent::ReferenceExpired { .. } => PipelineService::reference_expired(&emitter).await,
        };
        match sent {
            Ok(()) => tracing::debug!(?event, "signal emitted"),
            Err(e) => tracing::warn!(error = %e, ?event, "failed to emit signal"),
        }
    }
    Ok(())
}

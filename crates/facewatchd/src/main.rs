use anyhow::{Context, Result};
use facewatch_core::{EuclideanMatcher, FaceEmbedder, OnnxEmbeddingModel, UltraFaceLocator};
use facewatch_frame::{FramePool, ImageSequenceSource, SourceHandle};
use facewatchd::config::{BusKind, Config};
use facewatchd::dbus_interface::{self, PipelineService, BUS_NAME, OBJECT_PATH};
use facewatchd::engine::{spawn_engine, EngineHandle, Pipeline};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load().context("failed to load configuration")?;

    let embedder_path = config.embedder_model_path();
    let model = OnnxEmbeddingModel::load(&embedder_path)
        .with_context(|| format!("failed to load embedding model {embedder_path}"))?;
    tracing::info!(path = %embedder_path, "embedding model loaded");

    let locator_path = config.locator_model_path();
    let locator = UltraFaceLocator::load(&locator_path)
        .with_context(|| format!("failed to load face locator {locator_path}"))?
        .with_confidence_threshold(config.locator_confidence);
    tracing::info!(path = %locator_path, "face locator loaded");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = spawn_engine(
        Pipeline {
            locator: Box::new(locator),
            embedder: FaceEmbedder::new(Box::new(model), config.embedder_shape()),
            matcher: EuclideanMatcher::new(config.match_threshold),
            reference_timeout: config.reference_timeout(),
        },
        events_tx,
    )?;

    let source = start_source(&config, &engine)?;

    let shutdown = Arc::new(Notify::new());
    let service = PipelineService::new(engine.clone(), Arc::clone(&shutdown));
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(bus = ?config.bus, name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let forwarder = tokio::spawn(dbus_interface::forward_events(conn.clone(), events_rx));

    tracing::info!("facewatchd ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = shutdown.notified() => {}
    }
    tracing::info!("facewatchd shutting down");

    if let Some(source) = source {
        tokio::task::spawn_blocking(move || source.stop()).await?;
    }
    engine.shutdown().await?;
    // Give pending signals a moment to go out before the bus connection closes.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    forwarder.abort();
    drop(conn);

    tracing::info!("facewatchd stopped");
    Ok(())
}

/// Start the configured frame source feeding `engine`. Without one, the
/// daemon still accepts enrollments but never sees live frames.
fn start_source(config: &Config, engine: &EngineHandle) -> Result<Option<SourceHandle>> {
    let pool = FramePool::new(config.pool_capacity);
    let sink = Arc::new(engine.clone());

    if let Some(dir) = &config.frames_dir {
        let source = ImageSequenceSource::open(dir, config.frame_interval(), pool)
            .with_context(|| format!("failed to open frame directory {}", dir.display()))?;
        return Ok(Some(source.spawn(sink)?));
    }

    if let Some(device) = &config.camera_device {
        return start_camera(config, device, pool, sink);
    }

    tracing::warn!("no frame source configured (set frames_dir or camera_device)");
    Ok(None)
}

#[cfg(feature = "v4l")]
fn start_camera(
    config: &Config,
    device: &str,
    pool: Arc<FramePool>,
    sink: Arc<EngineHandle>,
) -> Result<Option<SourceHandle>> {
    let camera = facewatch_frame::Camera::open(device, config.camera_width, config.camera_height)?
        .with_rotation(config.rotation()?);
    Ok(Some(camera.spawn(pool, sink)?))
}

#[cfg(not(feature = "v4l"))]
fn start_camera(
    _config: &Config,
    device: &str,
    _pool: Arc<FramePool>,
    _sink: Arc<EngineHandle>,
) -> Result<Option<SourceHandle>> {
    anyhow::bail!("camera {device} configured but facewatchd was built without the v4l feature")
}

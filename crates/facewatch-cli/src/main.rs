use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{
    crop_face, Embedding, EuclideanMatcher, FaceEmbedder, FaceLocator, OnnxEmbeddingModel, UltraFaceLocator,
};
use facewatch_frame::{normalize, read_still};
use facewatchd::config::{BusKind, Config};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facewatch.Pipeline1",
    default_service = "org.facewatch.Pipeline1",
    default_path = "/org/facewatch/Pipeline1"
)]
trait Pipeline {
    async fn enroll_reference(&self, path: &str) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn shutdown(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face-match pipeline CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the configured one
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in a still image as the reference
    Enroll {
        /// Image containing exactly one face
        image: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Stop the daemon
    Shutdown,
    /// Compare the faces in two images without the daemon
    Compare { first: PathBuf, second: PathBuf },
    /// Print the embedding of the face in an image without the daemon
    Embed { image: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    let bus = if cli.system { BusKind::System } else { config.bus };

    match cli.command {
        Commands::Enroll { image } => {
            let path = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot resolve {}", image.display()))?;
            let proxy = connect(bus).await?;
            proxy
                .enroll_reference(&path.to_string_lossy())
                .await
                .context("enrollment failed")?;
            println!("Reference enrolled from {}", path.display());
            println!("Expires in {} ms unless matched", config.reference_timeout_ms);
        }
        Commands::Status => {
            let proxy = connect(bus).await?;
            let status = proxy.status().await?;
            let json: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Commands::Shutdown => {
            connect(bus).await?.shutdown().await?;
            println!("facewatchd stopping");
        }
        Commands::Compare { first, second } => {
            let mut models = OfflineModels::load(&config)?;
            let a = models.embed_file(&first)?;
            let b = models.embed_file(&second)?;
            let decision = EuclideanMatcher::new(config.match_threshold).compare(&a, &b)?;
            println!(
                "{}",
                serde_json::json!({
                    "distance": decision.distance,
                    "threshold": config.match_threshold,
                    "matched": decision.matched,
                })
            );
        }
        Commands::Embed { image } => {
            let mut models = OfflineModels::load(&config)?;
            let embedding = models.embed_file(&image)?;
            println!("{}", serde_json::to_string(&embedding.values)?);
        }
    }

    Ok(())
}

async fn connect(bus: BusKind) -> Result<PipelineProxy<'static>> {
    let conn = match bus {
        BusKind::Session => zbus::Connection::session().await,
        BusKind::System => zbus::Connection::system().await,
    }
    .context("failed to connect to D-Bus")?;
    PipelineProxy::new(&conn)
        .await
        .context("facewatchd is not running")
}

/// Locator and embedder loaded in-process, bypassing the daemon.
struct OfflineModels {
    locator: UltraFaceLocator,
    embedder: FaceEmbedder,
}

impl OfflineModels {
    fn load(config: &Config) -> Result<Self> {
        let locator = UltraFaceLocator::load(&config.locator_model_path())?
            .with_confidence_threshold(config.locator_confidence);
        let model = OnnxEmbeddingModel::load(&config.embedder_model_path())?;
        Ok(Self {
            locator,
            embedder: FaceEmbedder::new(Box::new(model), config.embedder_shape()),
        })
    }

    fn embed_file(&mut self, path: &Path) -> Result<Embedding> {
        let frame = read_still(path)?;
        let image = normalize(&frame).with_context(|| format!("cannot decode {}", path.display()))?;
        let faces = self.locator.locate(&image)?;
        let face = match faces.as_slice() {
            [face] => face,
            [] => bail!("no face found in {}", path.display()),
            many => bail!("{} faces found in {}; expected one", many.len(), path.display()),
        };
        let shape = self.embedder.shape();
        let crop = crop_face(&image, face, shape.input_width, shape.input_height)
            .with_context(|| format!("face region outside {}", path.display()))?;
        Ok(self.embedder.embed(&crop)?)
    }
}

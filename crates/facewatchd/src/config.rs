use facewatch_core::EmbedderShape;
use facewatch_frame::Rotation;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?} (expected session or system)")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEWATCH_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding model file name inside `model_dir`.
    pub embedder_model: String,
    /// Face locator model file name inside `model_dir`.
    pub locator_model: String,
    /// Face crop size fed to the embedding model.
    pub input_width: u32,
    pub input_height: u32,
    /// Length of the embedding the model produces.
    pub embedding_len: usize,
    /// Euclidean distance at or below which two faces match.
    pub match_threshold: f32,
    /// Minimum locator score for a face.
    pub locator_confidence: f32,
    /// How long an enrolled reference stays armed.
    pub reference_timeout_ms: u64,
    /// Replay this directory of images as the live feed.
    pub frames_dir: Option<PathBuf>,
    pub frame_interval_ms: u64,
    /// V4L2 device path for live capture (needs the `v4l` feature).
    pub camera_device: Option<String>,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Clockwise degrees that bring camera frames upright.
    pub camera_rotation: i32,
    /// Frame buffers shared between the source and the pipeline.
    pub pool_capacity: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let shape = EmbedderShape::default();
        Self {
            model_dir: facewatch_core::default_model_dir(),
            embedder_model: "mobile_facenet.onnx".to_string(),
            locator_model: "version-RFB-320.onnx".to_string(),
            input_width: shape.input_width,
            input_height: shape.input_height,
            embedding_len: shape.embedding_len,
            match_threshold: facewatch_core::DEFAULT_MATCH_THRESHOLD,
            locator_confidence: 0.7,
            reference_timeout_ms: 10_000,
            frames_dir: None,
            frame_interval_ms: 33,
            camera_device: None,
            camera_width: 640,
            camera_height: 480,
            camera_rotation: 0,
            pool_capacity: 4,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load the configuration file (if any) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    /// Apply `FACEWATCH_*` overrides looked up through `lookup`.
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("FACEWATCH_EMBEDDER_MODEL") {
            self.embedder_model = name;
        }
        if let Some(name) = lookup("FACEWATCH_LOCATOR_MODEL") {
            self.locator_model = name;
        }
        env_parse(&lookup, "FACEWATCH_INPUT_WIDTH", &mut self.input_width);
        env_parse(&lookup, "FACEWATCH_INPUT_HEIGHT", &mut self.input_height);
        env_parse(&lookup, "FACEWATCH_EMBEDDING_LEN", &mut self.embedding_len);
        env_parse(&lookup, "FACEWATCH_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(&lookup, "FACEWATCH_LOCATOR_CONFIDENCE", &mut self.locator_confidence);
        env_parse(&lookup, "FACEWATCH_REFERENCE_TIMEOUT_MS", &mut self.reference_timeout_ms);
        if let Some(dir) = lookup("FACEWATCH_FRAMES_DIR") {
            self.frames_dir = Some(PathBuf::from(dir)).filter(|p| !p.as_os_str().is_empty());
        }
        env_parse(&lookup, "FACEWATCH_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        if let Some(device) = lookup("FACEWATCH_CAMERA_DEVICE") {
            self.camera_device = Some(device).filter(|d| !d.is_empty());
        }
        env_parse(&lookup, "FACEWATCH_CAMERA_WIDTH", &mut self.camera_width);
        env_parse(&lookup, "FACEWATCH_CAMERA_HEIGHT", &mut self.camera_height);
        env_parse(&lookup, "FACEWATCH_CAMERA_ROTATION", &mut self.camera_rotation);
        env_parse(&lookup, "FACEWATCH_POOL_CAPACITY", &mut self.pool_capacity);
        env_parse(&lookup, "FACEWATCH_BUS", &mut self.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.locator_confidence) {
            return Err(ConfigError::Invalid(format!(
                "locator_confidence must be within 0..=1, got {}",
                self.locator_confidence
            )));
        }
        if self.input_width == 0 || self.input_height == 0 || self.embedding_len == 0 {
            return Err(ConfigError::Invalid(
                "input_width, input_height and embedding_len must be positive".into(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be at least 1".into()));
        }
        self.rotation()?;
        Ok(())
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join(&self.embedder_model).to_string_lossy().into_owned()
    }

    pub fn locator_model_path(&self) -> String {
        self.model_dir.join(&self.locator_model).to_string_lossy().into_owned()
    }

    pub fn embedder_shape(&self) -> EmbedderShape {
        EmbedderShape {
            input_width: self.input_width,
            input_height: self.input_height,
            embedding_len: self.embedding_len,
        }
    }

    pub fn reference_timeout(&self) -> Duration {
        Duration::from_millis(self.reference_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn rotation(&self) -> Result<Rotation, ConfigError> {
        Rotation::from_degrees(self.camera_rotation).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// `$FACEWATCH_CONFIG`, else `$XDG_CONFIG_HOME/facewatch/config.toml` if it exists.
fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FACEWATCH_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    let path = config_home.join("facewatch/config.toml");
    path.exists().then_some(path)
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.match_threshold, 1.0);
        assert_eq!(config.reference_timeout(), Duration::from_secs(10));
        assert_eq!(config.embedder_shape(), EmbedderShape::default());
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.embedder_model_path().ends_with("mobile_facenet.onnx"));
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            match_threshold = 0.8
            reference_timeout_ms = 2500
            frames_dir = "/var/lib/facewatch/frames"
            bus = "system"
            "#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.8);
        assert_eq!(config.reference_timeout_ms, 2500);
        assert_eq!(config.frames_dir, Some(PathBuf::from("/var/lib/facewatch/frames")));
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.embedding_len, 128);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("similarity_threshold = 0.4").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("FACEWATCH_MATCH_THRESHOLD", "0.6"),
            ("FACEWATCH_POOL_CAPACITY", "8"),
            ("FACEWATCH_BUS", "System"),
            ("FACEWATCH_CAMERA_DEVICE", "/dev/video2"),
            ("FACEWATCH_MODEL_DIR", "/opt/models"),
        ]));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.camera_device.as_deref(), Some("/dev/video2"));
        assert_eq!(config.locator_model_path(), "/opt/models/version-RFB-320.onnx");
    }

    #[test]
    fn test_env_unparsable_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("FACEWATCH_REFERENCE_TIMEOUT_MS", "soon")]));
        assert_eq!(config.reference_timeout_ms, 10_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config { pool_capacity: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config { match_threshold: f32::NAN, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { camera_rotation: 45, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { camera_rotation: -90, ..Config::default() };
        assert_eq!(config.rotation().unwrap(), Rotation::Deg270);
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/facewatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

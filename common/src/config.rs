use serde::Deserialize;
use std::path::{Component, Path};

/// Lowest accepted speed limit, km/h.
pub const MIN_SPEED_LIMIT: u32 = 10;
/// Highest accepted speed limit, km/h.
pub const MAX_SPEED_LIMIT: u32 = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub speed_limit: SpeedLimitConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    pub s3: Option<S3Config>,
    pub producer: Option<ProducerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix used when building links to locally stored evidence images.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Canonical frame width after resize.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Canonical frame height after resize.
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Run the detector on every N-th processed frame.
    #[serde(default = "default_detect_every")]
    pub detect_every: u64,
    /// Tracks whose update quality falls below this are dropped.
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    /// Pixel row of the horizontal reference line.
    #[serde(default = "default_line_y")]
    pub line_y: u32,
    /// Real-world distance covered while a box transits the line, metres.
    #[serde(default = "default_distance_m")]
    pub distance_m: f64,
    #[serde(default = "default_calibration")]
    pub calibration: f64,
    /// Measurements above this are clamped (near-zero elapsed times).
    #[serde(default = "default_max_speed_kmh")]
    pub max_speed_kmh: f64,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_max_idle_sleep_ms")]
    pub max_idle_sleep_ms: u64,
}

/// Which track wins when one detection mutually matches several tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Track whose center is closest to the detection's center.
    #[default]
    NearestCentroid,
    /// Most recently created matching track.
    LastInserted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Absolute grey-level difference from the background that counts as motion.
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,
    #[serde(default = "default_min_box")]
    pub min_width: u32,
    #[serde(default = "default_min_box")]
    pub min_height: u32,
    /// Background running-average weight of the newest frame (0..1).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Pixels searched around the previous position in each direction.
    #[serde(default = "default_search_margin")]
    pub search_margin: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeedLimitConfig {
    #[serde(default = "default_initial_limit")]
    pub initial: u32,
    /// Remote source polled for `{"max_speed": n}`. Polling is off when unset.
    pub poll_url: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for images when `backend = "local"`.
    #[serde(default = "default_evidence_dir")]
    pub dir: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_evidence_prefix")]
    pub prefix: String,
    /// Events waiting for the persistence worker; more are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// TTF font for the speed caption. Without it only the border is drawn.
    pub font_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_s3_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Public URL prefix for objects; defaults to `{endpoint}/{bucket}`.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub stream_url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            detect_every: default_detect_every(),
            min_quality: default_min_quality(),
            line_y: default_line_y(),
            distance_m: default_distance_m(),
            calibration: default_calibration(),
            max_speed_kmh: default_max_speed_kmh(),
            tie_break: TieBreak::default(),
            idle_sleep_ms: default_idle_sleep_ms(),
            max_idle_sleep_ms: default_max_idle_sleep_ms(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            diff_threshold: default_diff_threshold(),
            min_width: default_min_box(),
            min_height: default_min_box(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_margin: default_search_margin(),
        }
    }
}

impl Default for SpeedLimitConfig {
    fn default() -> Self {
        Self {
            initial: default_initial_limit(),
            poll_url: None,
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            dir: default_evidence_dir(),
            db_path: default_db_path(),
            prefix: default_evidence_prefix(),
            queue_capacity: default_queue_capacity(),
            jpeg_quality: default_jpeg_quality(),
            font_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.width == 0 || self.ingest.height == 0 {
            return Err(ConfigError::Invalid("ingest resolution must be non-zero".into()));
        }
        if self.tracking.detect_every == 0 {
            return Err(ConfigError::Invalid("tracking.detect_every must be >= 1".into()));
        }
        for (name, value) in [
            ("tracking.distance_m", self.tracking.distance_m),
            ("tracking.calibration", self.tracking.calibration),
            ("tracking.max_speed_kmh", self.tracking.max_speed_kmh),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }
        if !(self.tracking.min_quality.is_finite() && self.tracking.min_quality >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tracking.min_quality must be a non-negative finite number, got {}",
                self.tracking.min_quality
            )));
        }
        if self.tracking.line_y >= self.ingest.height {
            return Err(ConfigError::Invalid(format!(
                "tracking.line_y ({}) lies outside the {}px frame",
                self.tracking.line_y, self.ingest.height
            )));
        }
        if !(MIN_SPEED_LIMIT..=MAX_SPEED_LIMIT).contains(&self.speed_limit.initial) {
            return Err(ConfigError::Invalid(format!(
                "speed_limit.initial must be within {MIN_SPEED_LIMIT}..={MAX_SPEED_LIMIT}"
            )));
        }
        if self.speed_limit.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("speed_limit.poll_interval_secs must be >= 1".into()));
        }
        if self.evidence.queue_capacity == 0 {
            return Err(ConfigError::Invalid("evidence.queue_capacity must be >= 1".into()));
        }
        if self.evidence.backend == StorageBackend::Local
            && is_within(Path::new(&self.evidence.db_path), Path::new(&self.evidence.dir))
        {
            return Err(ConfigError::Invalid(format!(
                "evidence.db_path ({}) must not live inside the served image directory {}",
                self.evidence.db_path, self.evidence.dir
            )));
        }
        if self.evidence.backend == StorageBackend::S3 && self.s3.is_none() {
            return Err(ConfigError::Invalid(
                "evidence.backend = \"s3\" requires an [s3] section".into(),
            ));
        }
        if let Some(s3) = &self.s3 {
            if s3.access_key.is_empty() || s3.secret_key.is_empty() {
                return Err(ConfigError::Invalid("s3 credentials are empty".into()));
            }
        }
        if let Some(producer) = &self.producer {
            if producer.stream_url.is_empty() {
                return Err(ConfigError::Invalid("producer.stream_url is empty".into()));
            }
            if producer.mode != "mjpeg" && producer.mode != "polling" {
                return Err(ConfigError::Invalid(format!(
                    "producer.mode must be \"mjpeg\" or \"polling\", got {:?}",
                    producer.mode
                )));
            }
            if producer.mode == "polling" && !(producer.fps.is_finite() && producer.fps > 0.0) {
                return Err(ConfigError::Invalid("producer.fps must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Lexical containment, ignoring `.` components.
fn is_within(path: &Path, dir: &Path) -> bool {
    fn strip(p: &Path) -> Vec<Component<'_>> {
        p.components().filter(|c| *c != Component::CurDir).collect()
    }
    let (path, dir) = (strip(path), strip(dir));
    path.len() > dir.len() && path.starts_with(&dir)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_port() -> u16 {
    5000
}
fn default_public_base_url() -> String {
    "http://localhost:5000".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_detect_every() -> u64 {
    30
}
fn default_min_quality() -> f64 {
    7.0
}
fn default_line_y() -> u32 {
    250
}
fn default_distance_m() -> f64 {
    10.0
}
fn default_calibration() -> f64 {
    3.0
}
fn default_max_speed_kmh() -> f64 {
    300.0
}
fn default_idle_sleep_ms() -> u64 {
    10
}
fn default_max_idle_sleep_ms() -> u64 {
    200
}
fn default_diff_threshold() -> u8 {
    30
}
fn default_min_box() -> u32 {
    24
}
fn default_learning_rate() -> f32 {
    0.05
}
fn default_search_margin() -> u32 {
    16
}
fn default_initial_limit() -> u32 {
    30
}
fn default_poll_interval() -> u64 {
    60
}
fn default_poll_timeout() -> u64 {
    5
}
fn default_evidence_dir() -> String {
    "overspeeding".into()
}
fn default_db_path() -> String {
    "data/evidence.db".into()
}
fn default_evidence_prefix() -> String {
    "cars/".into()
}
fn default_queue_capacity() -> usize {
    32
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_s3_bucket() -> String {
    "overspeeding".into()
}
fn default_region() -> String {
    "us-east-1".into()
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    5.0
}
fn default_upload_url() -> String {
    "http://localhost:5000/upload_video".into()
}
fn default_log_level() -> String {
    "info".into()
}

// Configuration management for Vigil

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root folder for clips, archives, face crops and the database
    pub storage_path: PathBuf,

    /// Target interval between capture ticks in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Threads used to process sources within one tick (1 = process on the tick thread)
    #[serde(default = "default_detection_workers")]
    pub detection_workers: usize,

    #[serde(default)]
    pub archive: ArchiveSettings,

    #[serde(default)]
    pub detector: DetectorSettings,

    #[serde(default)]
    pub trigger: TriggerSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub clip: ClipSettings,

    /// Sources opened at startup
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// One configured camera or video origin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    /// Whether presence detection and recording triggering run for this source
    #[serde(default = "default_true")]
    pub armed: bool,
    /// Resize ratio applied before detection and before archiving
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            armed: true,
            scale_factor: default_scale_factor(),
        }
    }
}

/// Frame archive retention and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Frames older than this many days are dropped by the periodic prune
    pub retention_days: u32,
    /// How often the prune pass runs
    pub prune_interval_secs: u64,
    /// Upper bound on archived pixel bytes per source (0 = unbounded)
    #[serde(default)]
    pub max_bytes_per_source: u64,
    /// Write `<archive>/<source>.dat` when a source closes
    #[serde(default = "default_true")]
    pub persist_on_close: bool,
    /// Load `<archive>/<source>.dat` when a source opens
    #[serde(default = "default_true")]
    pub restore_on_open: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            prune_interval_secs: 3600,
            max_bytes_per_source: 1024 * 1024 * 1024,
            persist_on_close: true,
            restore_on_open: true,
        }
    }
}

/// Face localization and recognition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// OpenCV-format Haar cascade XML
    pub cascade_path: Option<PathBuf>,
    /// Scale step between detection pyramid levels (> 1.0)
    pub scale_step: f32,
    /// Neighbouring detections required to keep a face (0 = keep raw detections)
    pub min_neighbors: u32,
    /// Smallest face considered, in pixels of the scaled frame
    pub min_face_size: (u32, u32),
    /// Largest face considered (0 = unbounded)
    pub max_face_size: (u32, u32),
    /// Compare detected faces against enrolled identities
    #[serde(default = "default_true")]
    pub recognizer: bool,
    /// Maximum embedding distance accepted as a match
    pub match_threshold: f32,
    /// Save a luminance crop of every unrecognized face
    #[serde(default)]
    pub save_unmatched_faces: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            cascade_path: None,
            scale_step: 1.1,
            min_neighbors: 2,
            min_face_size: (30, 30),
            max_face_size: (0, 0),
            recognizer: true,
            match_threshold: 0.6,
            save_unmatched_faces: false,
        }
    }
}

/// Recording trigger windows, all in archive frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Frames before the triggering frame included in a clip
    pub lead_in_frames: u64,
    /// Frames after the clip start before an empty frame ends the recording
    pub leave_after_frames: u64,
    /// Frames trimmed from the end of a finished clip
    pub trailing_trim_frames: u64,
    /// Frames after a clip end during which no new recording opens
    pub cooldown_frames: u64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            lead_in_frames: 100,
            leave_after_frames: 100,
            trailing_trim_frames: 10,
            cooldown_frames: 200,
        }
    }
}

impl TriggerSettings {
    /// Clamp the trailing trim to the leave window, so a finished clip never
    /// ends before it starts
    pub fn sanitized(self) -> Self {
        if self.trailing_trim_frames <= self.leave_after_frames {
            return self;
        }
        log::warn!(
            "trailing_trim_frames ({}) exceeds leave_after_frames ({}), clamping",
            self.trailing_trim_frames,
            self.leave_after_frames
        );
        Self {
            trailing_trim_frames: self.leave_after_frames,
            ..self
        }
    }
}

/// Reconnection policy for failing sources
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Consecutive failed opens before a source is removed
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on one open attempt
    pub open_timeout_ms: u64,
    /// Bound on one frame read
    pub read_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            open_timeout_ms: 10_000,
            read_timeout_ms: 2_000,
        }
    }
}

impl ReconnectSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Clip encoder backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClipEncoderKind {
    /// GStreamer jpegenc + avimux
    #[default]
    Gstreamer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipSettings {
    pub fps: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    #[serde(default)]
    pub encoder: ClipEncoderKind,
    /// Pending clip jobs before new ones are rejected
    #[serde(default = "default_clip_queue")]
    pub queue_capacity: usize,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            jpeg_quality: 90,
            encoder: ClipEncoderKind::default(),
            queue_capacity: default_clip_queue(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            tick_interval_ms: default_tick_interval_ms(),
            detection_workers: default_detection_workers(),
            archive: ArchiveSettings::default(),
            detector: DetectorSettings::default(),
            trigger: TriggerSettings::default(),
            reconnect: ReconnectSettings::default(),
            clip: ClipSettings::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(mut config) => {
                        config.trigger = config.trigger.sanitized();
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse config {}: {}", config_path.display(), e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Get the default storage path
fn get_default_storage_path() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Vigil")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
        .join("config.toml")
}

fn default_tick_interval_ms() -> u64 {
    33
}

fn default_detection_workers() -> usize {
    1
}

fn default_scale_factor() -> f32 {
    1.0
}

fn default_clip_queue() -> usize {
    64
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}

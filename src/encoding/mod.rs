// Clip encoding
//
// A clip is an archived frame range muxed into one container file. Encoding
// backends implement `ClipEncoder`; the `ClipWriter` runs them off the tick
// thread and records each finished clip in the durable log.
//
// To add a backend:
// 1. Implement ClipEncoder for it
// 2. Add a ClipEncoderKind variant in config.rs
// 3. Map the variant in encoder_for()

pub mod clip;
#[cfg(feature = "gstreamer")]
pub mod gst_encoder;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::config::{ClipEncoderKind, ClipSettings};
use crate::recording::FrameRecord;

pub use clip::{ClipJob, ClipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("Invalid range {start}..={end} (archive holds {first}..{next})")]
    InvalidRange {
        start: u64,
        end: u64,
        first: u64,
        next: u64,
    },

    #[error("Encoder could not be opened: {0}")]
    EncoderOpenFailed(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Clip queue is full")]
    QueueFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording log error: {0}")]
    Log(String),
}

pub type Result<T> = std::result::Result<T, ClipError>;

/// A finished clip, as appended to the recording log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingEvent {
    /// Row id in the recording log
    pub id: i64,
    pub source: String,
    pub path: PathBuf,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub frame_count: usize,
}

/// Muxes a sequence of frames into one file
pub trait ClipEncoder: Send + Sync {
    /// File extension of the container, without the dot
    fn extension(&self) -> &'static str;

    /// Write `frames` to `path` at `fps`. `frames` is never empty.
    fn encode(&self, path: &Path, frames: &[FrameRecord], fps: u32) -> Result<()>;
}

/// Backend selected in the clip settings
pub fn encoder_for(settings: &ClipSettings) -> Result<Arc<dyn ClipEncoder>> {
    match settings.encoder {
        #[cfg(feature = "gstreamer")]
        ClipEncoderKind::Gstreamer => Ok(Arc::new(gst_encoder::GstClipEncoder::new(
            settings.jpeg_quality,
        ))),
        #[cfg(not(feature = "gstreamer"))]
        ClipEncoderKind::Gstreamer => Err(ClipError::EncoderOpenFailed(
            "built without the gstreamer feature".into(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Writes one `WIDTHxHEIGHT` line per frame instead of a container
    pub struct FrameListEncoder;

    impl ClipEncoder for FrameListEncoder {
        fn extension(&self) -> &'static str {
            "frames"
        }

        fn encode(&self, path: &Path, frames: &[FrameRecord], _fps: u32) -> Result<()> {
            let lines: Vec<String> = frames
                .iter()
                .map(|r| format!("{}x{}", r.frame.width(), r.frame.height()))
                .collect();
            std::fs::write(path, lines.join("\n"))?;
            Ok(())
        }
    }

    /// Frame sizes written by `FrameListEncoder`
    pub fn read_frame_list(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

// Per-source session state
//
// Everything mutable about one source lives here, behind the session's own
// mutex. The tick thread, the reconnect drain and operator commands all go
// through that lock, so a source is never read while it is being closed.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use super::SourceId;
use crate::capture::{Frame, FrameSource};
use crate::config::{SourceDescriptor, TriggerSettings};
use crate::detection::{crop_face, DetectionResult};
use crate::devices::LinkState;
use crate::recording::{FrameArchive, RecordingTrigger, TriggerPhase};
use crate::session::sanitize_name;

/// Size of the placeholder shown before a source has produced anything
const DEFAULT_PLACEHOLDER: (u32, u32) = (640, 480);

pub struct SourceSession {
    pub(crate) id: SourceId,
    pub(crate) name: String,
    pub(crate) url: String,
    pub(crate) armed: bool,
    pub(crate) scale_factor: f32,
    pub(crate) source: Option<Box<dyn FrameSource>>,
    pub(crate) link: LinkState,
    pub(crate) trigger: RecordingTrigger,
    /// Start index of an operator-initiated recording
    pub(crate) manual_start: Option<u64>,
    pub(crate) archive: FrameArchive,
    /// Index of the newest frame read from the source in this session
    pub(crate) last_good_index: Option<u64>,
    pub(crate) last_frame: Option<Arc<Frame>>,
    pub(crate) last_faces: usize,
    /// Numbering for saved unrecognized-face crops
    pub(crate) unrecognized_count: u64,
    /// Set once the session has been finalized; later ticks skip it
    pub(crate) closed: bool,
}

impl SourceSession {
    pub(crate) fn new(
        id: SourceId,
        descriptor: &SourceDescriptor,
        source: Box<dyn FrameSource>,
        trigger: TriggerSettings,
        archive: FrameArchive,
    ) -> Self {
        Self {
            id,
            name: descriptor.name.clone(),
            url: descriptor.url.clone(),
            armed: descriptor.armed,
            scale_factor: descriptor.scale_factor,
            source: Some(source),
            link: LinkState::Healthy,
            trigger: RecordingTrigger::new(trigger),
            manual_start: None,
            archive,
            last_good_index: None,
            last_frame: None,
            last_faces: 0,
            unrecognized_count: 0,
            closed: false,
        }
    }

    /// Latest frame for display; a placeholder unless the source is healthy
    pub(crate) fn display_frame(&self) -> Arc<Frame> {
        match (&self.link, &self.last_frame) {
            (LinkState::Healthy, Some(frame)) => frame.clone(),
            (_, Some(frame)) => Arc::new(Frame::placeholder(frame.width(), frame.height())),
            (_, None) => Arc::new(Frame::placeholder(DEFAULT_PLACEHOLDER.0, DEFAULT_PLACEHOLDER.1)),
        }
    }

    /// Write a luminance crop of every unmatched face to `faces_dir`
    pub(crate) fn save_unmatched_faces(
        &mut self,
        faces_dir: &Path,
        result: &DetectionResult,
        luma: &image::GrayImage,
    ) {
        for region in result.unmatched() {
            self.unrecognized_count += 1;
            let path = faces_dir.join(format!(
                "{}_unrecognized_{}.jpg",
                sanitize_name(&self.name),
                self.unrecognized_count
            ));
            if let Err(e) = crop_face(luma, region).save(&path) {
                log::warn!("[Detector] Could not save face crop {}: {}", path.display(), e);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            name: self.name.clone(),
            url: self.url.clone(),
            armed: self.armed,
            scale_factor: self.scale_factor,
            link: self.link,
            trigger: self.trigger.phase(),
            manual_recording_start: self.manual_start,
            archived_frames: self.archive.len(),
            first_index: self.archive.first_index(),
            next_index: self.archive.next_index(),
            archive_bytes: self.archive.byte_len(),
            faces_in_last_frame: self.last_faces,
            unrecognized_faces_saved: self.unrecognized_count,
        }
    }
}

/// Read-only view of a session for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub armed: bool,
    pub scale_factor: f32,
    pub link: LinkState,
    pub trigger: TriggerPhase,
    pub manual_recording_start: Option<u64>,
    pub archived_frames: usize,
    pub first_index: u64,
    pub next_index: u64,
    pub archive_bytes: usize,
    pub faces_in_last_frame: usize,
    pub unrecognized_faces_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DecodeError;
    use crate::detection::{DetectedFace, FaceRegion};
    use image::GrayImage;

    struct Idle;

    impl FrameSource for Idle {
        fn read_frame(&mut self) -> Result<Frame, DecodeError> {
            Err(DecodeError::EndOfStream)
        }
    }

    fn session(name: &str) -> SourceSession {
        SourceSession::new(
            SourceId::new(0, 1),
            &SourceDescriptor::new(name, "images://nowhere"),
            Box::new(Idle),
            TriggerSettings::default(),
            FrameArchive::new(),
        )
    }

    #[test]
    fn display_frame_is_a_placeholder_until_healthy_frames_arrive() {
        let mut s = session("porch");
        let frame = s.display_frame();
        assert_eq!((frame.width(), frame.height()), DEFAULT_PLACEHOLDER);

        let real = Arc::new(Frame::from_gray(GrayImage::from_pixel(8, 6, image::Luma([200]))));
        s.last_frame = Some(real.clone());
        assert!(Arc::ptr_eq(&s.display_frame(), &real));

        s.link = LinkState::Removed;
        let shown = s.display_frame();
        assert_eq!((shown.width(), shown.height()), (8, 6));
        assert_eq!(*shown, Frame::placeholder(8, 6));
    }

    #[test]
    fn face_crops_are_numbered_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = session("Front Door");
        let mut b = session("yard");
        let luma = GrayImage::from_pixel(40, 40, image::Luma([90]));
        let result = DetectionResult {
            faces: vec![
                DetectedFace {
                    region: FaceRegion { x: 0, y: 0, width: 10, height: 10 },
                    identity: None,
                },
                DetectedFace {
                    region: FaceRegion { x: 20, y: 20, width: 10, height: 10 },
                    identity: None,
                },
            ],
        };

        a.save_unmatched_faces(dir.path(), &result, &luma);
        b.save_unmatched_faces(dir.path(), &result, &luma);

        assert!(dir.path().join("Front_Door_unrecognized_1.jpg").exists());
        assert!(dir.path().join("Front_Door_unrecognized_2.jpg").exists());
        assert!(dir.path().join("yard_unrecognized_1.jpg").exists());
        assert_eq!(a.snapshot().unrecognized_faces_saved, 2);
    }
}

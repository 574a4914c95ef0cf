//! Presence detection
//!
//! Per frame, for armed sources only:
//! 1. resize by the source's scale factor
//! 2. convert to luminance
//! 3. localize faces ([`FaceLocalizer`], normally a Haar cascade)
//! 4. optionally embed each face and look it up in the [`IdentitySet`]
//! 5. draw green (matched) or red (unmatched) boxes on the archived copy
//!
//! Recording is driven by [`DetectionResult::has_unmatched`], not by the raw
//! face count: a recognised resident never opens a clip.

pub mod annotate;
pub mod cascade;
pub mod embedding;
pub mod identity;

use std::sync::Arc;

use image::GrayImage;
use serde::Serialize;

use crate::capture::Frame;
use crate::config::DetectorSettings;

pub use cascade::{CascadeLocalizer, CascadeParams, HaarCascade};
pub use embedding::{embedding_distance, LbphEmbedder};
pub use identity::{EnrolledIdentity, IdentityMatch, IdentitySet};

/// Error type for detector setup and enrollment
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Cascade load error: {0}")]
    CascadeLoad(String),

    #[error("Expected exactly one face, found {0}")]
    FaceCount(usize),

    #[error("Face recognition is disabled")]
    RecognizerDisabled,

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Axis-aligned face rectangle in pixels of the scaled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Intersection with a `width` x `height` image (at least 1x1 inside it)
    pub fn clamped(&self, width: u32, height: u32) -> FaceRegion {
        let x = self.x.min(width.saturating_sub(1));
        let y = self.y.min(height.saturating_sub(1));
        FaceRegion {
            x,
            y,
            width: self.width.min(width - x).max(1),
            height: self.height.min(height - y).max(1),
        }
    }
}

/// Finds face rectangles in a luminance image
pub trait FaceLocalizer: Send + Sync {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion>;
}

/// Maps a face crop to a fixed-length vector
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, gray: &GrayImage, region: &FaceRegion) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub identity: Option<IdentityMatch>,
}

/// Per-frame detection outcome. Transient: only its aggregate feeds the trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub faces: Vec<DetectedFace>,
}

impl DetectionResult {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn has_unmatched(&self) -> bool {
        self.faces.iter().any(|f| f.identity.is_none())
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &FaceRegion> {
        self.faces
            .iter()
            .filter(|f| f.identity.is_none())
            .map(|f| &f.region)
    }
}

/// A frame after the detection pass
pub struct ProcessedFrame {
    /// Scaled and annotated frame, ready for archiving
    pub frame: Frame,
    pub result: DetectionResult,
    /// Luminance of the scaled frame (only when detection ran)
    pub luma: Option<GrayImage>,
}

pub struct PresenceDetector {
    localizer: Box<dyn FaceLocalizer>,
    embedder: Option<Box<dyn FaceEmbedder>>,
    identities: Arc<IdentitySet>,
    match_threshold: f32,
}

impl PresenceDetector {
    pub fn new(
        localizer: Box<dyn FaceLocalizer>,
        embedder: Option<Box<dyn FaceEmbedder>>,
        identities: Arc<IdentitySet>,
        match_threshold: f32,
    ) -> Self {
        Self {
            localizer,
            embedder,
            identities,
            match_threshold,
        }
    }

    /// Haar cascade localizer plus (optionally) the LBP embedder, as configured
    pub fn from_settings(
        settings: &DetectorSettings,
        identities: Arc<IdentitySet>,
    ) -> Result<Self, DetectorError> {
        let path = settings
            .cascade_path
            .as_ref()
            .ok_or_else(|| DetectorError::CascadeLoad("no cascade_path configured".into()))?;
        let cascade = HaarCascade::load(path)?;
        let params = CascadeParams {
            scale_step: settings.scale_step,
            min_neighbors: settings.min_neighbors,
            min_size: settings.min_face_size,
            max_size: settings.max_face_size,
        };
        let embedder: Option<Box<dyn FaceEmbedder>> = if settings.recognizer {
            Some(Box::new(LbphEmbedder::new()))
        } else {
            None
        };
        Ok(Self::new(
            Box::new(CascadeLocalizer::new(cascade, params)),
            embedder,
            identities,
            settings.match_threshold,
        ))
    }

    pub fn identities(&self) -> &Arc<IdentitySet> {
        &self.identities
    }

    /// Scale the frame and, if `armed`, detect and annotate faces
    pub fn process(&self, frame: &Frame, scale: f32, armed: bool) -> ProcessedFrame {
        let scaled = frame.scaled(scale);
        if !armed {
            return ProcessedFrame {
                frame: scaled,
                result: DetectionResult::default(),
                luma: None,
            };
        }

        let gray = scaled.to_luma_image();
        let faces: Vec<DetectedFace> = self
            .localizer
            .locate(&gray)
            .into_iter()
            .map(|region| DetectedFace {
                identity: self.identify(&gray, &region),
                region,
            })
            .collect();

        let frame = if faces.is_empty() {
            scaled
        } else {
            let mut rgb = scaled.to_rgb_image();
            for face in &faces {
                let color = if face.identity.is_some() {
                    annotate::MATCHED_COLOR
                } else {
                    annotate::UNMATCHED_COLOR
                };
                annotate::draw_box(&mut rgb, &face.region, color);
            }
            Frame::from_rgb(rgb)
        };

        ProcessedFrame {
            frame,
            result: DetectionResult { faces },
            luma: Some(gray),
        }
    }

    fn identify(&self, gray: &GrayImage, region: &FaceRegion) -> Option<IdentityMatch> {
        let embedder = self.embedder.as_ref()?;
        if self.identities.is_empty() {
            return None;
        }
        let embedding = embedder.embed(gray, region);
        self.identities.best_match(&embedding, self.match_threshold)
    }

    /// Embedding of the single face in a reference image
    pub fn enrollment_embedding(&self, gray: &GrayImage) -> Result<Vec<f32>, DetectorError> {
        let embedder = self.embedder.as_ref().ok_or(DetectorError::RecognizerDisabled)?;
        let regions = self.localizer.locate(gray);
        if regions.len() != 1 {
            return Err(DetectorError::FaceCount(regions.len()));
        }
        Ok(embedder.embed(gray, &regions[0]))
    }
}

/// Luminance crop of one face
pub fn crop_face(gray: &GrayImage, region: &FaceRegion) -> GrayImage {
    let region = region.clamped(gray.width(), gray.height());
    image::imageops::crop_imm(gray, region.x, region.y, region.width, region.height).to_image()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Reports a fixed face wherever the image centre is brighter than `threshold`
    pub struct BrightCenterLocalizer {
        pub threshold: u8,
    }

    impl FaceLocalizer for BrightCenterLocalizer {
        fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion> {
            let (w, h) = gray.dimensions();
            if w < 4 || h < 4 || gray.get_pixel(w / 2, h / 2).0[0] <= self.threshold {
                return Vec::new();
            }
            vec![FaceRegion { x: w / 4, y: h / 4, width: w / 2, height: h / 2 }]
        }
    }

    /// Embeds a face as its mean brightness
    pub struct MeanEmbedder;

    impl FaceEmbedder for MeanEmbedder {
        fn embed(&self, gray: &GrayImage, region: &FaceRegion) -> Vec<f32> {
            let crop = crop_face(gray, region);
            let total: u64 = crop.pixels().map(|p| p.0[0] as u64).sum();
            vec![total as f32 / crop.pixels().len().max(1) as f32 / 255.0]
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    pub fn detector(identities: Arc<IdentitySet>) -> PresenceDetector {
        PresenceDetector::new(
            Box::new(BrightCenterLocalizer { threshold: 100 }),
            Some(Box::new(MeanEmbedder)),
            identities,
            0.05,
        )
    }

    pub fn gray_frame(value: u8) -> Frame {
        Frame::from_gray(GrayImage::from_pixel(16, 12, image::Luma([value])))
    }
}

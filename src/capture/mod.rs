// Frame capture: decoded pixel buffers and the sources that produce them
//
// A `FrameSource` is one open decoding resource (a device, a stream, a file).
// `SourceOpener` turns a URL into a source. Neither retries anything: failures
// are reported upward verbatim and the reconnection manager decides what to do.

pub mod image_dir;
#[cfg(feature = "gstreamer")]
pub mod gst_source;

use std::fmt;
use std::time::Duration;

use image::{DynamicImage, GrayImage, ImageBuffer, RgbImage};
use serde::{Deserialize, Serialize};

pub use image_dir::ImageDirSource;

/// Error type for decoder operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to open source: {0}")]
    OpenFailed(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Pixel layout of a frame buffer
///
/// The numeric tags are the OpenCV matrix type codes (`CV_8UC1`, `CV_8UC3`)
/// so archives written by earlier deployments stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }

    pub fn type_tag(self) -> i32 {
        match self {
            PixelFormat::Gray8 => 0,
            PixelFormat::Rgb8 => 16,
        }
    }

    pub fn from_type_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(PixelFormat::Gray8),
            16 => Some(PixelFormat::Rgb8),
            _ => None,
        }
    }
}

/// A decoded, tightly packed frame
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw buffer. Returns `None` if the length does not match the dimensions.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return None;
        }
        Some(Self { width, height, format, data })
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgb8,
            data: image.into_raw(),
        }
    }

    pub fn from_gray(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Gray8,
            data: image.into_raw(),
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => Self::from_gray(gray),
            other => Self::from_rgb(other.to_rgb8()),
        }
    }

    /// Flat dark-grey frame shown while a source has no live picture
    pub fn placeholder(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self::from_rgb(RgbImage::from_pixel(width, height, image::Rgb([32, 32, 32])))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        match self.format {
            PixelFormat::Rgb8 => ImageBuffer::from_raw(self.width, self.height, self.data.clone())
                .unwrap_or_else(|| RgbImage::new(self.width, self.height)),
            PixelFormat::Gray8 => DynamicImage::ImageLuma8(self.to_luma_image()).to_rgb8(),
        }
    }

    /// Single-channel luminance copy of the frame
    pub fn to_luma_image(&self) -> GrayImage {
        match self.format {
            PixelFormat::Gray8 => ImageBuffer::from_raw(self.width, self.height, self.data.clone())
                .unwrap_or_else(|| GrayImage::new(self.width, self.height)),
            PixelFormat::Rgb8 => DynamicImage::ImageRgb8(self.to_rgb_image()).to_luma8(),
        }
    }

    /// Resize by a ratio. A ratio of 1.0 (or anything that rounds to the same size) is a copy.
    pub fn scaled(&self, factor: f32) -> Frame {
        if !factor.is_finite() || factor <= 0.0 {
            return self.clone();
        }
        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);
        self.resized(width, height)
    }

    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let filter = image::imageops::FilterType::Triangle;
        match self.format {
            PixelFormat::Rgb8 => Frame::from_rgb(image::imageops::resize(
                &self.to_rgb_image(),
                width,
                height,
                filter,
            )),
            PixelFormat::Gray8 => Frame::from_gray(image::imageops::resize(
                &self.to_luma_image(),
                width,
                height,
                filter,
            )),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One open decoding resource. Dropping it releases the resource.
pub trait FrameSource: Send {
    /// Read the next frame. Must return within the source's read timeout.
    fn read_frame(&mut self) -> Result<Frame, DecodeError>;
}

/// Opens sources by URL. Shared between the tick thread and reconnect workers.
pub trait SourceOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError>;
}

/// Dispatches a URL to the decoder that can handle it
///
/// - `images://<dir>` or an existing directory: still-image sequence, stops at the end
/// - `images+loop://<dir>`: still-image sequence, wraps around
/// - anything else (device index, file path, rtsp/http URI): GStreamer, when built with it
pub struct DefaultOpener {
    pub open_timeout: Duration,
    pub read_timeout: Duration,
}

impl DefaultOpener {
    pub fn new(open_timeout: Duration, read_timeout: Duration) -> Self {
        Self { open_timeout, read_timeout }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError> {
        if let Some(dir) = url.strip_prefix("images+loop://") {
            return Ok(Box::new(ImageDirSource::open(dir, true)?));
        }
        if let Some(dir) = url.strip_prefix("images://") {
            return Ok(Box::new(ImageDirSource::open(dir, false)?));
        }
        if std::path::Path::new(url).is_dir() {
            return Ok(Box::new(ImageDirSource::open(url, false)?));
        }
        self.open_stream(url)
    }
}

impl DefaultOpener {
    #[cfg(feature = "gstreamer")]
    fn open_stream(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError> {
        let source = gst_source::GstFrameSource::open(url, self.open_timeout, self.read_timeout)?;
        Ok(Box::new(source))
    }

    #[cfg(not(feature = "gstreamer"))]
    fn open_stream(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError> {
        Err(DecodeError::OpenFailed(format!(
            "no decoder for '{}' (built without the gstreamer feature)",
            url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(4, 4, PixelFormat::Rgb8, vec![0; 47]).is_none());
        assert!(Frame::new(4, 4, PixelFormat::Gray8, vec![0; 16]).is_some());
    }

    #[test]
    fn scaled_frame_rounds_dimensions() {
        let frame = Frame::placeholder(640, 480);
        let half = frame.scaled(0.5);
        assert_eq!((half.width(), half.height()), (320, 240));
        assert_eq!(half.byte_len(), 320 * 240 * 3);
        assert_eq!(frame.scaled(1.0), frame);
    }

    #[test]
    fn luma_of_gray_frame_is_identity() {
        let frame = Frame::new(2, 1, PixelFormat::Gray8, vec![10, 200]).unwrap();
        assert_eq!(frame.to_luma_image().into_raw(), vec![10, 200]);
    }

    #[test]
    fn type_tags_match_opencv_codes() {
        assert_eq!(PixelFormat::Rgb8.type_tag(), 16);
        assert_eq!(PixelFormat::from_type_tag(0), Some(PixelFormat::Gray8));
        assert_eq!(PixelFormat::from_type_tag(24), None);
    }

    #[test]
    fn unknown_url_without_decoder_fails_to_open() {
        let opener = DefaultOpener::new(Duration::from_secs(1), Duration::from_secs(1));
        if cfg!(not(feature = "gstreamer")) {
            assert!(matches!(
                opener.open("rtsp://127.0.0.1:1/none"),
                Err(DecodeError::OpenFailed(_))
            ));
        }
        assert!(opener.open("images:///definitely/not/here").is_err());
    }
}

// GStreamer clip backend
//
// Pipeline: appsrc (RGB) -> videoconvert -> jpegenc -> avimux -> filesink

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{ClipEncoder, ClipError, Result};
use crate::recording::FrameRecord;

pub struct GstClipEncoder {
    quality: u8,
}

impl GstClipEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl ClipEncoder for GstClipEncoder {
    fn extension(&self) -> &'static str {
        "avi"
    }

    fn encode(&self, path: &Path, frames: &[FrameRecord], fps: u32) -> Result<()> {
        let first = frames
            .first()
            .ok_or_else(|| ClipError::Encode("no frames to encode".into()))?;
        let width = first.frame.width();
        let height = first.frame.height();
        let fps = fps.max(1);

        let writer = ClipPipeline::new(path, width, height, fps, self.quality)?;
        let frame_ns = 1_000_000_000u64 / fps as u64;
        for (i, record) in frames.iter().enumerate() {
            let rgb = if record.frame.width() == width && record.frame.height() == height {
                record.frame.to_rgb_image()
            } else {
                record.frame.resized(width, height).to_rgb_image()
            };
            writer.push(rgb.into_raw(), i as u64 * frame_ns, frame_ns)?;
        }
        writer.finish()
    }
}

struct ClipPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
}

impl ClipPipeline {
    fn new(path: &Path, width: u32, height: u32, fps: u32, quality: u8) -> Result<Self> {
        let open_err = |what: &str, e: gst::glib::BoolError| {
            ClipError::EncoderOpenFailed(format!("Failed to create {}: {}", what, e))
        };

        crate::gstreamer_init::init_gstreamer_env();
        gst::init().map_err(|e| ClipError::EncoderOpenFailed(e.to_string()))?;

        let pipeline = gst::Pipeline::new();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(fps as i32, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .block(true)
            .build();

        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| open_err("videoconvert", e))?;
        let jpegenc = gst::ElementFactory::make("jpegenc")
            .property("quality", quality as i32)
            .build()
            .map_err(|e| open_err("jpegenc", e))?;
        let muxer = gst::ElementFactory::make("avimux")
            .build()
            .map_err(|e| open_err("avimux", e))?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| open_err("filesink", e))?;

        let elements = [appsrc.upcast_ref(), &convert, &jpegenc, &muxer, &filesink];
        pipeline
            .add_many(elements)
            .map_err(|e| ClipError::EncoderOpenFailed(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| ClipError::EncoderOpenFailed(format!("Failed to link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ClipError::EncoderOpenFailed(format!("Failed to start pipeline: {:?}", e)))?;

        Ok(Self { pipeline, appsrc })
    }

    fn push(&self, data: Vec<u8>, pts_ns: u64, duration_ns: u64) -> Result<()> {
        let mut buffer = gst::Buffer::from_mut_slice(data);
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| ClipError::Encode(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    /// Send EOS and wait for the muxer to finalize the file
    fn finish(self) -> Result<()> {
        if let Err(e) = self.appsrc.end_of_stream() {
            log::warn!("[Clip] Failed to send EOS: {:?}", e);
        }

        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| ClipError::Encode("pipeline has no bus".into()))?;
        let mut outcome = Err(ClipError::Encode("timed out waiting for EOS".into()));
        for msg in bus.iter_timed(gst::ClockTime::from_seconds(30)) {
            match msg.view() {
                gst::MessageView::Eos(..) => {
                    outcome = Ok(());
                    break;
                }
                gst::MessageView::Error(err) => {
                    outcome = Err(ClipError::Encode(format!(
                        "Pipeline error: {} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                    break;
                }
                _ => {}
            }
        }
        outcome
    }
}

impl Drop for ClipPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::Frame;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;

    /// True when GStreamer and every named element are available
    pub(crate) fn have_elements(names: &[&str]) -> bool {
        crate::gstreamer_init::init_gstreamer_env();
        gst::init().is_ok() && names.iter().all(|n| gst::ElementFactory::find(n).is_some())
    }

    pub(crate) fn records(count: u32, width: u32, height: u32) -> Vec<FrameRecord> {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        (0..count)
            .map(|i| {
                let time = NaiveTime::from_hms_opt(9, 0, i).unwrap();
                FrameRecord::new(date, time, Arc::new(Frame::placeholder(width, height)))
            })
            .collect()
    }

    #[test]
    fn clip_is_written_as_avi() {
        if !have_elements(&["appsrc", "videoconvert", "jpegenc", "avimux", "filesink"]) {
            eprintln!("GStreamer clip elements not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");

        let mut frames = records(4, 64, 48);
        frames.push(records(1, 32, 24).remove(0));
        GstClipEncoder::new(80).encode(&path, &frames, 10).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 224);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
    }

    #[test]
    fn empty_clip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.avi");
        assert!(GstClipEncoder::new(80).encode(&path, &[], 30).is_err());
        assert!(!path.exists());
    }
}

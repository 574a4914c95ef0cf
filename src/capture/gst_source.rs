// GStreamer-backed frame source
//
// Pipeline: (v4l2src | uridecodebin) → videoconvert → capsfilter(RGB) → appsink
//
// A bare integer URL is a local capture device index, anything else is handed
// to uridecodebin (file paths are converted to file:// URIs). The appsink keeps
// at most two buffers and drops older ones, so a slow tick never backs up a
// live camera.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{DecodeError, Frame, FrameSource, PixelFormat};

pub struct GstFrameSource {
    url: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: Duration,
}

impl GstFrameSource {
    pub fn open(url: &str, open_timeout: Duration, read_timeout: Duration) -> Result<Self, DecodeError> {
        crate::gstreamer_init::init_gstreamer_env();
        gst::init().map_err(|e| DecodeError::OpenFailed(e.to_string()))?;

        let pipeline = gst::Pipeline::new();

        let videoconvert = make_element("videoconvert")?;
        let caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| DecodeError::OpenFailed(format!("Failed to create capsfilter: {}", e)))?;

        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .max_buffers(2)
            .drop(true)
            .sync(false)
            .build();

        let source = Self::create_source_element(url)?;

        pipeline
            .add_many([&source, &videoconvert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| DecodeError::OpenFailed(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([&videoconvert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| DecodeError::OpenFailed(format!("Failed to link pipeline: {}", e)))?;

        if source.static_pad("src").is_some() {
            source
                .link(&videoconvert)
                .map_err(|e| DecodeError::OpenFailed(format!("Failed to link source: {}", e)))?;
        } else {
            // uridecodebin exposes pads once it has typed the stream
            let videoconvert_weak = videoconvert.downgrade();
            source.connect_pad_added(move |_src, src_pad| {
                let Some(videoconvert) = videoconvert_weak.upgrade() else {
                    return;
                };
                let is_video = src_pad
                    .current_caps()
                    .or_else(|| Some(src_pad.query_caps(None)))
                    .and_then(|caps| {
                        caps.structure(0)
                            .map(|s| s.name().as_str().starts_with("video/"))
                    })
                    .unwrap_or(false);
                if !is_video {
                    return;
                }
                if let Some(sink_pad) = videoconvert.static_pad("sink") {
                    if !sink_pad.is_linked() {
                        if let Err(e) = src_pad.link(&sink_pad) {
                            log::warn!("[Capture] Failed to link decoded video pad: {:?}", e);
                        }
                    }
                }
            });
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| DecodeError::OpenFailed(format!("Failed to start pipeline: {:?}", e)))?;

        // Wait for the pipeline to preroll or fail, bounded by the open timeout
        let Some(bus) = pipeline.bus() else {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DecodeError::OpenFailed("Failed to get pipeline bus".into()));
        };
        let timeout = gst::ClockTime::from_mseconds(open_timeout.as_millis() as u64);
        let mut ready = false;
        for msg in bus.iter_timed(timeout) {
            match msg.view() {
                gst::MessageView::AsyncDone(_) => {
                    ready = true;
                    break;
                }
                gst::MessageView::StateChanged(change) => {
                    let from_pipeline = change
                        .src()
                        .map(|s| s == pipeline.upcast_ref::<gst::Object>())
                        .unwrap_or(false);
                    if from_pipeline && change.current() == gst::State::Playing {
                        ready = true;
                        break;
                    }
                }
                gst::MessageView::Error(err) => {
                    let _ = pipeline.set_state(gst::State::Null);
                    return Err(DecodeError::OpenFailed(format!(
                        "{}: {} ({:?})",
                        url,
                        err.error(),
                        err.debug()
                    )));
                }
                _ => {}
            }
        }
        if !ready {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DecodeError::OpenFailed(format!(
                "{}: timed out after {:?}",
                url, open_timeout
            )));
        }

        log::info!("[Capture] Opened {}", url);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            read_timeout,
        })
    }

    fn create_source_element(url: &str) -> Result<gst::Element, DecodeError> {
        if let Ok(index) = url.trim().parse::<u32>() {
            #[cfg(target_os = "linux")]
            {
                return gst::ElementFactory::make("v4l2src")
                    .property("device", format!("/dev/video{}", index))
                    .build()
                    .map_err(|e| DecodeError::OpenFailed(format!("Failed to create v4l2src: {}", e)));
            }
            #[cfg(target_os = "macos")]
            {
                return gst::ElementFactory::make("avfvideosrc")
                    .property("device-index", index as i32)
                    .build()
                    .map_err(|e| DecodeError::OpenFailed(format!("Failed to create avfvideosrc: {}", e)));
            }
            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            {
                return gst::ElementFactory::make("ksvideosrc")
                    .property("device-index", index as i32)
                    .build()
                    .map_err(|e| DecodeError::OpenFailed(format!("Failed to create ksvideosrc: {}", e)));
            }
        }

        let uri = if url.contains("://") {
            url.to_string()
        } else {
            let path = std::fs::canonicalize(url)
                .map_err(|e| DecodeError::OpenFailed(format!("{}: {}", url, e)))?;
            gst::glib::filename_to_uri(&path, None)
                .map_err(|e| DecodeError::OpenFailed(format!("{}: {}", url, e)))?
                .to_string()
        };

        gst::ElementFactory::make("uridecodebin")
            .property("uri", uri)
            .build()
            .map_err(|e| DecodeError::OpenFailed(format!("Failed to create uridecodebin: {}", e)))
    }

    /// Surface any pipeline error posted since the last read
    fn check_bus(&self) -> Result<(), DecodeError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(DecodeError::Decode(format!("{}: {}", self.url, err.error())));
                }
                gst::MessageView::Eos(_) => return Err(DecodeError::EndOfStream),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for GstFrameSource {
    fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        self.check_bus()?;

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(DecodeError::EndOfStream);
            }
            self.check_bus()?;
            return Err(DecodeError::Decode(format!(
                "{}: no frame within {:?}",
                self.url, self.read_timeout
            )));
        };

        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::Decode("Sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| DecodeError::Decode(format!("Bad video caps: {}", e)))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::Decode("No buffer in sample".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| DecodeError::Decode(format!("Failed to map buffer: {}", e)))?;

        // Copy out row by row: the buffer stride may be padded
        let width = info.width();
        let height = info.height();
        let row_bytes = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let offset = info.offset()[0];
        let src = map.as_slice();
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = offset + row * stride;
            let end = start + row_bytes;
            if end > src.len() {
                return Err(DecodeError::Decode("Truncated video buffer".into()));
            }
            data.extend_from_slice(&src[start..end]);
        }

        Frame::new(width, height, PixelFormat::Rgb8, data)
            .ok_or_else(|| DecodeError::Decode("Frame size mismatch".into()))
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        log::debug!("[Capture] Closed {}", self.url);
    }
}

fn make_element(name: &str) -> Result<gst::Element, DecodeError> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| DecodeError::OpenFailed(format!("Failed to create {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::gst_encoder::tests::{have_elements, records};
    use crate::encoding::gst_encoder::GstClipEncoder;
    use crate::encoding::ClipEncoder;

    #[test]
    fn recorded_clip_reads_back_frame_by_frame() {
        let needed = [
            "appsrc", "videoconvert", "jpegenc", "avimux", "filesink",
            "uridecodebin", "avidemux", "jpegdec", "appsink",
        ];
        if !have_elements(&needed) {
            eprintln!("GStreamer decode elements not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        GstClipEncoder::new(90).encode(&path, &records(3, 64, 48), 10).unwrap();

        let mut source = GstFrameSource::open(
            path.to_str().unwrap(),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .unwrap();
        let mut read = 0;
        loop {
            match source.read_frame() {
                Ok(frame) => {
                    assert_eq!((frame.width(), frame.height()), (64, 48));
                    read += 1;
                }
                Err(DecodeError::EndOfStream) => break,
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }
        // The appsink drops the oldest buffers when reads fall behind
        assert!((1..=3).contains(&read));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.avi");
        let result = GstFrameSource::open(
            missing.to_str().unwrap(),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(DecodeError::OpenFailed(_))));
    }
}

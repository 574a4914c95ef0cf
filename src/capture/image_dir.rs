// Still-image sequence source: every JPEG/PNG in a directory, in name order

use std::path::{Path, PathBuf};

use super::{DecodeError, Frame, FrameSource};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
    looping: bool,
}

impl ImageDirSource {
    pub fn open<P: AsRef<Path>>(dir: P, looping: bool) -> Result<Self, DecodeError> {
        let dir = dir.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| DecodeError::OpenFailed(format!("{}: {}", dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(DecodeError::OpenFailed(format!(
                "{}: no images found",
                dir.display()
            )));
        }

        log::debug!("[Capture] Opened image sequence {} ({} files)", dir.display(), files.len());

        Ok(Self {
            dir,
            files,
            position: 0,
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        if self.position >= self.files.len() {
            if !self.looping {
                return Err(DecodeError::EndOfStream);
            }
            self.position = 0;
        }

        let path = &self.files[self.position];
        self.position += 1;

        let image = image::open(path).map_err(|e| {
            DecodeError::Decode(format!("{} ({}): {}", path.display(), self.dir.display(), e))
        })?;
        Ok(Frame::from_dynamic(image))
    }
}

// Command handlers behind the CLI
//
// Each handler does the work and returns plain data; printing is left to main.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::detection::{IdentitySet, PresenceDetector};
use crate::recording::load_archive;
use crate::session::{sanitize_name, unique_path, EventLog, FaceRecord, NewFace, RecordingLogEntry};

// ============================================================================
// Identity enrollment
// ============================================================================

/// Descriptive fields of a face being enrolled
#[derive(Debug, Clone)]
pub struct Enrollment<'a> {
    pub name: &'a str,
    pub age: Option<u32>,
    pub gender: Option<&'a str>,
    pub image: &'a Path,
}

/// Enroll the single face in `enrollment.image`
///
/// The reference image is copied into `faces_dir` and its embedding stored
/// with the face record. The running detector picks the identity up on its
/// next start.
pub fn enroll_from_image(
    detector: &PresenceDetector,
    log: &EventLog,
    faces_dir: &Path,
    enrollment: &Enrollment<'_>,
) -> anyhow::Result<FaceRecord> {
    let image = image::open(enrollment.image)
        .with_context(|| format!("Failed to read {}", enrollment.image.display()))?;
    let embedding = detector
        .enrollment_embedding(&image.to_luma8())
        .with_context(|| format!("Cannot enroll from {}", enrollment.image.display()))?;

    std::fs::create_dir_all(faces_dir)?;
    let extension = enrollment
        .image
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let stored = unique_path(faces_dir, &sanitize_name(enrollment.name), extension);
    std::fs::copy(enrollment.image, &stored)
        .with_context(|| format!("Failed to copy reference image to {}", stored.display()))?;

    let image_path = stored.to_string_lossy().to_string();
    let id = log.insert_face(&NewFace {
        name: enrollment.name,
        age: enrollment.age,
        gender: enrollment.gender,
        encoding: &embedding,
        image_path: &image_path,
    })?;
    log::info!("[Detector] Enrolled {} as identity {}", enrollment.name, id);

    Ok(FaceRecord {
        id,
        name: enrollment.name.to_string(),
        age: enrollment.age,
        gender: enrollment.gender.map(str::to_string),
        encoding: embedding,
        image_path,
    })
}

/// Detector used only for enrollment; nothing is matched against it
pub fn enrollment_detector(settings: &crate::config::DetectorSettings) -> anyhow::Result<PresenceDetector> {
    let mut settings = settings.clone();
    settings.recognizer = true;
    PresenceDetector::from_settings(&settings, std::sync::Arc::new(IdentitySet::new()))
        .context("Failed to set up the face detector")
}

/// Change the descriptive fields of identity `id`
pub fn update_identity(
    log: &EventLog,
    id: i64,
    name: &str,
    age: Option<u32>,
    gender: Option<&str>,
) -> anyhow::Result<FaceRecord> {
    if !log.update_face(id, name, age, gender)? {
        anyhow::bail!("No identity with id {}", id);
    }
    log.get_face(id)?
        .ok_or_else(|| anyhow::anyhow!("Identity {} vanished during update", id))
}

/// Remove identity `id` and its stored reference image
pub fn revoke_identity(log: &EventLog, faces_dir: &Path, id: i64) -> anyhow::Result<FaceRecord> {
    let face = log
        .get_face(id)?
        .ok_or_else(|| anyhow::anyhow!("No identity with id {}", id))?;
    log.delete_face(id)?;

    // Only images we copied in are ours to remove
    let image = PathBuf::from(&face.image_path);
    if image.starts_with(faces_dir) && image.exists() {
        if let Err(e) = std::fs::remove_file(&image) {
            log::warn!("[Detector] Could not remove {}: {}", image.display(), e);
        }
    }
    log::info!("[Detector] Revoked identity {} ({})", id, face.name);
    Ok(face)
}

// ============================================================================
// Recording log
// ============================================================================

pub fn recent_recordings(
    log: &EventLog,
    camera: Option<&str>,
    limit: usize,
) -> anyhow::Result<Vec<RecordingLogEntry>> {
    log.recent_recordings(camera, limit)
}

// ============================================================================
// Archive inspection
// ============================================================================

/// Frames stored for one calendar date
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateSummary {
    pub date: NaiveDate,
    pub frames: usize,
    pub first: NaiveDateTime,
    pub last: NaiveDateTime,
}

/// Overview of a persisted archive file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub frames: usize,
    pub pixel_bytes: usize,
    /// Distinct frame sizes, in first-seen order
    pub dimensions: Vec<(u32, u32)>,
    pub dates: Vec<DateSummary>,
}

/// Read an archive file and summarize it by date
pub fn inspect_archive(path: &Path) -> anyhow::Result<ArchiveSummary> {
    let cancel = AtomicBool::new(false);
    let records = load_archive(path, &mut |_, _| {}, &cancel)
        .with_context(|| format!("Failed to read archive {}", path.display()))?;

    let mut dimensions: Vec<(u32, u32)> = Vec::new();
    let mut dates: Vec<DateSummary> = Vec::new();
    let mut pixel_bytes = 0;

    for record in &records {
        pixel_bytes += record.frame.byte_len();
        let size = (record.frame.width(), record.frame.height());
        if !dimensions.contains(&size) {
            dimensions.push(size);
        }

        let at = record.timestamp();
        match dates.last_mut() {
            Some(day) if day.date == record.date => {
                day.frames += 1;
                day.last = at;
            }
            _ => dates.push(DateSummary {
                date: record.date,
                frames: 1,
                first: at,
                last: at,
            }),
        }
    }

    Ok(ArchiveSummary {
        path: path.to_path_buf(),
        frames: records.len(),
        pixel_bytes,
        dimensions,
        dates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use crate::detection::testing::detector;
    use crate::recording::{save_archive, FrameArchive, FrameRecord};
    use chrono::NaiveTime;
    use image::{GrayImage, Luma};
    use std::sync::Arc;

    fn reference_image(dir: &Path, value: u8) -> PathBuf {
        let path = dir.join(format!("ref_{}.png", value));
        GrayImage::from_pixel(16, 12, Luma([value])).save(&path).unwrap();
        path
    }

    #[test]
    fn enrollment_stores_the_face_and_a_copy_of_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let faces = dir.path().join("faces");
        let log = EventLog::open_in_memory().unwrap();
        let detector = detector(Arc::new(IdentitySet::new()));
        let image = reference_image(dir.path(), 200);

        let face = enroll_from_image(
            &detector,
            &log,
            &faces,
            &Enrollment { name: "Ana Lee", age: Some(34), gender: None, image: &image },
        )
        .unwrap();

        assert_eq!(face.image_path, faces.join("Ana_Lee.png").to_string_lossy());
        assert!(faces.join("Ana_Lee.png").exists());
        let stored = log.list_faces().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Ana Lee");
        assert_eq!(stored[0].age, Some(34));
        assert_eq!(stored[0].encoding, face.encoding);
    }

    #[test]
    fn enrollment_needs_exactly_one_face() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open_in_memory().unwrap();
        let detector = detector(Arc::new(IdentitySet::new()));
        // Dark image: the stub localizer finds nothing
        let image = reference_image(dir.path(), 10);

        let result = enroll_from_image(
            &detector,
            &log,
            &dir.path().join("faces"),
            &Enrollment { name: "Nobody", age: None, gender: None, image: &image },
        );
        assert!(result.is_err());
        assert!(log.list_faces().unwrap().is_empty());
    }

    #[test]
    fn revoke_removes_record_and_copied_image() {
        let dir = tempfile::tempdir().unwrap();
        let faces = dir.path().join("faces");
        let log = EventLog::open_in_memory().unwrap();
        let detector = detector(Arc::new(IdentitySet::new()));
        let image = reference_image(dir.path(), 220);
        let face = enroll_from_image(
            &detector,
            &log,
            &faces,
            &Enrollment { name: "kim", age: None, gender: Some("f"), image: &image },
        )
        .unwrap();

        let renamed = update_identity(&log, face.id, "Kim Park", Some(40), Some("f")).unwrap();
        assert_eq!(renamed.name, "Kim Park");
        assert_eq!(renamed.encoding, face.encoding);

        revoke_identity(&log, &faces, face.id).unwrap();
        assert!(log.list_faces().unwrap().is_empty());
        assert!(!Path::new(&face.image_path).exists());
        // The caller's original stays
        assert!(image.exists());
        assert!(revoke_identity(&log, &faces, face.id).is_err());
    }

    #[test]
    fn archive_summary_groups_frames_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("porch.dat");
        let day1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let at = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let frame = Arc::new(Frame::placeholder(4, 2));

        let mut archive = FrameArchive::new();
        archive.append(FrameRecord::new(day1, at(8), frame.clone()));
        archive.append(FrameRecord::new(day1, at(9), frame.clone()));
        archive.append(FrameRecord::new(day2, at(7), Arc::new(Frame::placeholder(2, 2))));
        save_archive(&archive, &path).unwrap();

        let summary = inspect_archive(&path).unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.pixel_bytes, 4 * 2 * 3 * 2 + 2 * 2 * 3);
        assert_eq!(summary.dimensions, vec![(4, 2), (2, 2)]);
        assert_eq!(summary.dates.len(), 2);
        assert_eq!(summary.dates[0].frames, 2);
        assert_eq!(summary.dates[0].last, day1.and_time(at(9)));
        assert_eq!(summary.dates[1].date, day2);
    }

    #[test]
    fn inspecting_a_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_archive(&dir.path().join("none.dat")).is_err());
    }
}

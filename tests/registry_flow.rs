// End-to-end flow through the public registry API with scripted sources

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use image::{GrayImage, Luma};
use parking_lot::Mutex;

use vigil_lib::capture::{DecodeError, Frame, FrameSource, SourceOpener};
use vigil_lib::config::{ArchiveSettings, SourceDescriptor, TriggerSettings};
use vigil_lib::detection::{FaceEmbedder, FaceLocalizer, FaceRegion, IdentitySet, PresenceDetector};
use vigil_lib::devices::{LinkState, ReconnectPolicy};
use vigil_lib::encoding::{ClipEncoder, ClipWriter};
use vigil_lib::notifications::{EventBus, RegistryEvent, RemovalReason};
use vigil_lib::recording::{FrameRecord, TriggerPhase};
use vigil_lib::registry::{CameraRegistry, RegistrySettings};
use vigil_lib::session::{EventLog, StorageLayout};

const BRIGHT: u8 = 220;
const DARK: u8 = 20;

/// Anything brighter than mid-grey in the centre is a face
struct CentreLocalizer;

impl FaceLocalizer for CentreLocalizer {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (w, h) = gray.dimensions();
        if gray.get_pixel(w / 2, h / 2).0[0] > 128 {
            vec![FaceRegion { x: w / 4, y: h / 4, width: w / 2, height: h / 2 }]
        } else {
            Vec::new()
        }
    }
}

struct BrightnessEmbedder;

impl FaceEmbedder for BrightnessEmbedder {
    fn embed(&self, gray: &GrayImage, region: &FaceRegion) -> Vec<f32> {
        vec![gray.get_pixel(region.x, region.y).0[0] as f32 / 255.0]
    }

    fn dimension(&self) -> usize {
        1
    }
}

/// Writes the clip's frame sizes, one `WIDTHxHEIGHT` line per frame
struct SizeListEncoder;

impl ClipEncoder for SizeListEncoder {
    fn extension(&self) -> &'static str {
        "txt"
    }

    fn encode(&self, path: &std::path::Path, frames: &[FrameRecord], _fps: u32) -> vigil_lib::encoding::Result<()> {
        let sizes: Vec<String> = frames
            .iter()
            .map(|r| format!("{}x{}", r.frame.width(), r.frame.height()))
            .collect();
        std::fs::write(path, sizes.join("\n"))?;
        Ok(())
    }
}

fn clip_sizes(path: &str) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// One step of a scripted source: a frame of that brightness, or a read failure
type Step = Option<u8>;

struct ScriptedSource {
    steps: VecDeque<Step>,
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        match self.steps.pop_front() {
            Some(None) => Err(DecodeError::Decode("stream dropped".into())),
            Some(Some(value)) => Ok(frame(value)),
            None => Ok(frame(DARK)),
        }
    }
}

/// Each open of a URL takes the next script; no script left means the open fails
#[derive(Default)]
struct ScriptedOpener {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
}

impl ScriptedOpener {
    fn script(&self, url: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(steps);
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError> {
        let steps = self
            .scripts
            .lock()
            .get_mut(url)
            .and_then(|scripts| scripts.pop_front())
            .ok_or_else(|| DecodeError::OpenFailed(url.to_string()))?;
        Ok(Box::new(ScriptedSource { steps: steps.into() }))
    }
}

fn frame(value: u8) -> Frame {
    Frame::from_gray(GrayImage::from_pixel(32, 24, Luma([value])))
}

struct Harness {
    _dir: tempfile::TempDir,
    layout: StorageLayout,
    log: Arc<EventLog>,
    clips: Arc<ClipWriter>,
    opener: Arc<ScriptedOpener>,
    registry: CameraRegistry,
    events: crossbeam_channel::Receiver<RegistryEvent>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(dir.path());
    layout.ensure_dirs().unwrap();
    let log = Arc::new(EventLog::open(&layout.database_path()).unwrap());
    let bus = EventBus::new();
    let events = bus.subscribe(4096);

    let clips = Arc::new(
        ClipWriter::new(
            Arc::new(SizeListEncoder),
            layout.recordings_dir(),
            log.clone(),
            bus.clone(),
            10,
            8,
        )
        .unwrap(),
    );
    let detector = Arc::new(PresenceDetector::new(
        Box::new(CentreLocalizer),
        Some(Box::new(BrightnessEmbedder)),
        Arc::new(IdentitySet::new()),
        0.05,
    ));
    let settings = RegistrySettings {
        trigger: TriggerSettings {
            lead_in_frames: 2,
            leave_after_frames: 4,
            trailing_trim_frames: 1,
            cooldown_frames: 5,
        },
        archive: ArchiveSettings {
            persist_on_close: true,
            restore_on_open: true,
            ..ArchiveSettings::default()
        },
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
        save_unmatched_faces: true,
        detection_workers: 2,
    };
    let opener = Arc::new(ScriptedOpener::default());
    let registry = CameraRegistry::new(
        settings,
        layout.clone(),
        opener.clone(),
        detector,
        clips.clone(),
        bus,
    );

    Harness {
        _dir: dir,
        layout,
        log,
        clips,
        opener,
        registry,
        events,
    }
}

fn drain(events: &crossbeam_channel::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
    events
        .try_iter()
        .filter(|e| !matches!(e, RegistryEvent::FrameReady { .. }))
        .collect()
}

#[test]
fn visitor_is_recorded_while_another_source_reconnects() {
    let h = harness();
    h.opener.script("test://gate", vec![Some(DARK), Some(DARK), Some(DARK), Some(BRIGHT)]);
    h.opener.script("test://yard", vec![Some(DARK), Some(DARK), Some(DARK), None]);
    h.opener.script("test://yard", vec![]);

    let gate = h.registry.open_source(&SourceDescriptor::new("gate", "test://gate")).unwrap();
    let yard = h.registry.open_source(&SourceDescriptor::new("yard", "test://yard")).unwrap();
    assert!(h.registry.open_source(&SourceDescriptor::new("shed", "test://shed")).is_err());

    for _ in 0..3 {
        assert_eq!(h.registry.tick().frames, 2);
    }

    // Face on the gate, stream drop on the yard
    let summary = h.registry.tick();
    assert_eq!((summary.frames, summary.reconnecting), (1, 1));
    assert_eq!(
        h.registry.snapshot(gate).unwrap().trigger,
        TriggerPhase::Recording { start: 1 }
    );
    assert!(h.registry.snapshot(yard).unwrap().link.is_reconnecting());
    let placeholder = h.registry.latest_frame(yard).unwrap();
    assert_eq!(*placeholder, Frame::placeholder(32, 24));

    assert!(h.registry.wait_for_reconnects(Duration::from_secs(5)));
    assert_eq!(h.registry.tick().frames, 2);
    assert_eq!(h.registry.snapshot(yard).unwrap().link, LinkState::Healthy);

    // Index 5 is empty and past the leave window: clip 1..=4
    h.registry.tick();
    assert_eq!(
        h.registry.snapshot(gate).unwrap().trigger,
        TriggerPhase::Cooldown { until: 4 }
    );
    assert!(h.clips.wait_idle(Duration::from_secs(10)));

    let recordings = h.log.recent_recordings(Some("gate"), 10).unwrap();
    assert_eq!(recordings.len(), 1);
    assert_eq!(clip_sizes(&recordings[0].file_path), vec!["32x24"; 4]);
    assert!(h.layout.faces_dir().join("gate_unrecognized_1.jpg").exists());

    let events = drain(&h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::OpenFailed { source, .. } if source == "shed"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::RecordingStarted { source, start_index: 1, manual: false } if source == "gate"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::SourceReconnecting { source, .. } if source == "yard"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::RecordingFinished(r) if r.source == "gate" && r.frame_count == 4
    )));

    h.registry.shutdown();
    assert!(h.registry.is_empty());
    assert!(h.layout.archive_path("gate").exists());
    assert!(h.layout.archive_path("yard").exists());
}

#[test]
fn source_that_never_comes_back_is_removed_and_its_recording_kept() {
    let h = harness();
    h.opener.script("test://porch", vec![Some(BRIGHT), Some(BRIGHT), None]);

    let porch = h.registry.open_source(&SourceDescriptor::new("porch", "test://porch")).unwrap();
    h.registry.tick();
    h.registry.tick();
    assert!(matches!(
        h.registry.snapshot(porch).unwrap().trigger,
        TriggerPhase::Recording { start: 0 }
    ));

    // Read failure, then both reconnect attempts fail
    h.registry.tick();
    let mut removed = 0;
    for _ in 0..10 {
        assert!(h.registry.wait_for_reconnects(Duration::from_secs(5)));
        removed += h.registry.tick().removed;
        if removed > 0 {
            break;
        }
    }
    assert_eq!(removed, 1);
    assert!(h.registry.snapshot(porch).is_err());
    assert!(h.registry.is_empty());

    // The open recording ends at the last frame read
    assert!(h.clips.wait_idle(Duration::from_secs(10)));
    let recordings = h.log.recent_recordings(Some("porch"), 10).unwrap();
    assert_eq!(recordings.len(), 1);
    assert_eq!(clip_sizes(&recordings[0].file_path).len(), 2);

    let events = drain(&h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::SourceRemoved { source, reason: RemovalReason::ReconnectExhausted } if source == "porch"
    )));
}

#[test]
fn archive_is_restored_when_a_source_reopens() {
    let h = harness();
    h.opener.script("test://lobby", vec![]);
    h.opener.script("test://lobby", vec![]);

    let first = h.registry.open_source(&SourceDescriptor::new("lobby", "test://lobby")).unwrap();
    for _ in 0..3 {
        h.registry.tick();
    }
    h.registry.close_source(first).unwrap();

    let second = h.registry.open_source(&SourceDescriptor::new("lobby", "test://lobby")).unwrap();
    assert_ne!(first, second);
    let snapshot = h.registry.snapshot(second).unwrap();
    assert_eq!(snapshot.archived_frames, 3);
    assert_eq!(snapshot.next_index, 3);
    assert_eq!(h.registry.archive_dates(second).unwrap().len(), 1);
}

// Vigil - multi-camera presence recorder
// Main library entry point

pub mod capture;
pub mod commands;
pub mod config;
pub mod detection;
pub mod devices;
pub mod encoding;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_init;
pub mod notifications;
pub mod recording;
pub mod registry;
pub mod session;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::capture::DefaultOpener;
use crate::config::Config;
use crate::detection::{EnrolledIdentity, IdentitySet, PresenceDetector};
use crate::encoding::ClipWriter;
use crate::notifications::{EventBus, RegistryEvent};
use crate::registry::{CameraRegistry, RegistrySettings, TickDriver};
use crate::session::{EventLog, StorageLayout};

/// Queue depth of the event-logging subscriber
const MONITOR_QUEUE: usize = 256;

/// Initialize env_logger with `info` as the default level. Later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Load the config at `config_path`, start every configured source and run
/// until Ctrl+C
pub fn run(config_path: &Path) -> anyhow::Result<()> {
    init_logging();

    #[cfg(feature = "gstreamer")]
    gstreamer_init::init_gstreamer_env();

    let config = Config::load_or_default(config_path);
    log::info!("[Vigil] Using config {}", config_path.display());

    let runtime = Runtime::start(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            log::info!("[Vigil] Shutdown signal received");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    log::info!(
        "[Vigil] Running with {} source(s), press Ctrl+C to stop",
        runtime.registry.len()
    );
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    runtime.shutdown();
    log::info!("[Vigil] Shutdown complete");
    Ok(())
}

/// Open the recording log under `layout`. Failing here is fatal for the process.
pub fn open_event_log(layout: &StorageLayout) -> anyhow::Result<EventLog> {
    EventLog::open(&layout.database_path())
        .with_context(|| format!("Failed to open recording log {}", layout.database_path().display()))
}

/// Enrolled identities as stored in the face table
pub fn load_identities(log: &EventLog) -> anyhow::Result<IdentitySet> {
    let faces = log.list_faces().context("Failed to read enrolled faces")?;
    Ok(IdentitySet::from_identities(
        faces
            .into_iter()
            .map(|face| EnrolledIdentity::new(face.id, face.name, face.encoding)),
    ))
}

/// The running pieces of the `run` command
pub struct Runtime {
    pub registry: Arc<CameraRegistry>,
    driver: TickDriver,
    monitor_stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Build the detector, clip writer and registry, open the configured
    /// sources and start ticking
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let layout = StorageLayout::new(&config.storage_path);
        layout
            .ensure_dirs()
            .with_context(|| format!("Failed to create storage under {}", layout.root().display()))?;

        let log = Arc::new(open_event_log(&layout)?);

        let identities = Arc::new(load_identities(&log)?);
        log::info!("[Detector] {} enrolled identities", identities.len());
        let detector = Arc::new(
            PresenceDetector::from_settings(&config.detector, identities)
                .context("Failed to set up the face detector")?,
        );

        let events = EventBus::new();
        let monitor_stop = Arc::new(AtomicBool::new(false));
        let monitor = spawn_event_monitor(events.subscribe(MONITOR_QUEUE), monitor_stop.clone())?;

        let encoder = encoding::encoder_for(&config.clip)?;
        let clips = Arc::new(ClipWriter::new(
            encoder,
            layout.recordings_dir(),
            log.clone(),
            events.clone(),
            config.clip.fps,
            config.clip.queue_capacity,
        )?);

        let opener = Arc::new(DefaultOpener::new(
            config.reconnect.open_timeout(),
            config.reconnect.read_timeout(),
        ));
        let registry = Arc::new(CameraRegistry::new(
            RegistrySettings::from_config(config),
            layout,
            opener,
            detector,
            clips,
            events,
        ));

        for descriptor in &config.sources {
            if let Err(e) = registry.open_source(descriptor) {
                log::warn!("[Vigil] Skipping source {}: {}", descriptor.name, e);
            }
        }

        let driver = TickDriver::spawn(registry.clone(), config.tick_interval(), config.archive.clone())
            .context("Failed to start the tick thread")?;

        Ok(Self {
            registry,
            driver,
            monitor_stop,
            monitor: Some(monitor),
        })
    }

    /// Stop ticking, close every source and drain the clip queue
    pub fn shutdown(mut self) {
        self.driver.stop();
        self.registry.shutdown();

        self.monitor_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                log::error!("[Vigil] Event monitor thread panicked");
            }
        }
    }
}

/// Log every notification except frames
fn spawn_event_monitor(
    events: Receiver<RegistryEvent>,
    stop_flag: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("vigil-events".into())
        .spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match events.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => log_event(&event),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Whatever shutdown published
            for event in events.try_iter() {
                log_event(&event);
            }
        })
        .context("Failed to start the event monitor")
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::FrameReady { .. } => {}
        RegistryEvent::SourceOpened { source } => log::info!("[Events] {} is live", source),
        RegistryEvent::SourceReconnecting { source, reason } => {
            log::warn!("[Events] {} lost: {}", source, reason)
        }
        RegistryEvent::SourceRemoved { source, reason } => {
            log::info!("[Events] {} removed ({:?})", source, reason)
        }
        RegistryEvent::OpenFailed { source, reason } => {
            log::warn!("[Events] {} failed to open: {}", source, reason)
        }
        RegistryEvent::RecordingStarted { source, start_index, manual } => log::info!(
            "[Events] {} recording from frame {}{}",
            source,
            start_index,
            if *manual { " (manual)" } else { "" }
        ),
        RegistryEvent::RecordingFinished(recording) => log::info!(
            "[Events] {} saved {} ({} frames, {} to {})",
            recording.source,
            recording.path.display(),
            recording.frame_count,
            recording.start.format("%H:%M:%S"),
            recording.end.format("%H:%M:%S")
        ),
        RegistryEvent::ClipFailed { source, reason } => {
            log::warn!("[Events] {} clip failed: {}", source, reason)
        }
    }
}

//! Camera registry
//!
//! Owns every open source and drives the per-tick pipeline:
//!
//! ```text
//! drain reconnect outcomes
//! for each session (optionally spread over a worker pool):
//!     Reconnecting -> issue the next attempt when due, publish a placeholder
//!     Healthy      -> read -> detect -> trigger -> archive -> publish
//! drop sessions whose reconnection ran out
//! ```
//!
//! Sessions live in an arena of slots addressed by [`SourceId`]. A slot is
//! reused after its source closes, with a bumped generation, so an id held by
//! a background task can never resolve to the wrong source. Each session has
//! its own mutex; the slot table lock is only held long enough to clone the
//! session handles out of it.

pub mod driver;
pub mod session;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::capture::{DecodeError, Frame, SourceOpener};
use crate::config::{ArchiveSettings, Config, SourceDescriptor, TriggerSettings};
use crate::detection::PresenceDetector;
use crate::devices::{LinkState, ReconnectPolicy, ReconnectionManager};
use crate::encoding::{ClipError, ClipWriter};
use crate::notifications::{EventBus, RegistryEvent, RemovalReason};
use crate::recording::{self, ArchiveError, ClosedInterval, FrameArchive, TriggerAction};
use crate::session::StorageLayout;

pub use driver::TickDriver;
pub use session::{SessionSnapshot, SourceSession};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A source named '{0}' is already open")]
    AlreadyOpen(String),

    #[error("Unknown or closed source")]
    UnknownSource,

    #[error(transparent)]
    OpenFailed(DecodeError),

    #[error("No manual recording in progress")]
    NotRecording,

    #[error("A manual recording is already in progress")]
    AlreadyRecording,

    #[error("Scale factor must be positive, got {0}")]
    InvalidScale(f32),

    #[error(transparent)]
    Clip(#[from] ClipError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Stable handle to an open source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceId {
    index: u32,
    generation: u32,
}

impl SourceId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    session: Option<Arc<Mutex<SourceSession>>>,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Frames read, processed and archived
    pub frames: usize,
    /// Sources currently reconnecting
    pub reconnecting: usize,
    /// Sources dropped because reconnection ran out
    pub removed: usize,
}

enum SessionOutcome {
    Frame,
    Reconnecting,
    Removed,
    Skipped,
}

/// Registry-wide settings taken from the config at construction
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub trigger: TriggerSettings,
    pub archive: ArchiveSettings,
    pub reconnect: ReconnectPolicy,
    pub save_unmatched_faces: bool,
    pub detection_workers: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trigger: config.trigger,
            archive: config.archive.clone(),
            reconnect: ReconnectPolicy::from_settings(&config.reconnect),
            save_unmatched_faces: config.detector.save_unmatched_faces,
            detection_workers: config.detection_workers.max(1),
        }
    }
}

pub struct CameraRegistry {
    slots: RwLock<Vec<Slot>>,
    /// Serializes open/close against each other so names stay unique
    lifecycle: Mutex<()>,
    opener: Arc<dyn SourceOpener>,
    detector: Arc<PresenceDetector>,
    reconnect: ReconnectionManager,
    clips: Arc<ClipWriter>,
    events: EventBus,
    layout: StorageLayout,
    settings: RegistrySettings,
}

impl CameraRegistry {
    pub fn new(
        settings: RegistrySettings,
        layout: StorageLayout,
        opener: Arc<dyn SourceOpener>,
        detector: Arc<PresenceDetector>,
        clips: Arc<ClipWriter>,
        events: EventBus,
    ) -> Self {
        let reconnect = ReconnectionManager::new(opener.clone(), settings.reconnect);
        Self {
            slots: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            opener,
            detector,
            reconnect,
            clips,
            events,
            layout,
            settings,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn detector(&self) -> &Arc<PresenceDetector> {
        &self.detector
    }

    // ========================================================================
    // Open / close
    // ========================================================================

    /// Open a source and add it to the tick
    ///
    /// The URL is opened synchronously; a failure is reported (and published as
    /// `OpenFailed`) but not retried.
    pub fn open_source(&self, descriptor: &SourceDescriptor) -> Result<SourceId> {
        validate_scale(descriptor.scale_factor)?;
        let _lifecycle = self.lifecycle.lock();

        if self.find(&descriptor.name).is_some() {
            return Err(RegistryError::AlreadyOpen(descriptor.name.clone()));
        }

        let source = match self.opener.open(&descriptor.url) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("[Registry] Could not open {} ({}): {}", descriptor.name, descriptor.url, e);
                self.events.publish(RegistryEvent::OpenFailed {
                    source: descriptor.name.clone(),
                    reason: e.to_string(),
                });
                return Err(RegistryError::OpenFailed(e));
            }
        };

        let archive = self.initial_archive(&descriptor.name);

        let mut slots = self.slots.write();
        let index = match slots.iter().position(|s| s.session.is_none()) {
            Some(free) => free,
            None => {
                slots.push(Slot {
                    generation: 0,
                    session: None,
                });
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        slot.generation += 1;
        let id = SourceId::new(index as u32, slot.generation);
        slot.session = Some(Arc::new(Mutex::new(SourceSession::new(
            id,
            descriptor,
            source,
            self.settings.trigger,
            archive,
        ))));
        drop(slots);

        log::info!("[Registry] Opened {} ({}) as {}", descriptor.name, descriptor.url, id);
        self.events.publish(RegistryEvent::SourceOpened {
            source: descriptor.name.clone(),
        });
        Ok(id)
    }

    fn initial_archive(&self, name: &str) -> FrameArchive {
        let mut archive = FrameArchive::with_max_bytes(self.settings.archive.max_bytes_per_source as usize);
        if !self.settings.archive.restore_on_open {
            return archive;
        }
        let path = self.layout.archive_path(name);
        if !path.exists() {
            return archive;
        }

        let mut last_logged = 0u64;
        let mut progress = |read: u64, total: u64| {
            let percent = if total > 0 { read * 100 / total } else { 100 };
            if percent >= last_logged + 25 {
                last_logged = percent;
                log::info!("[Archive] Restoring {}: {}%", name, percent);
            }
        };
        let cancel = AtomicBool::new(false);
        match recording::restore_into(&mut archive, &path, &mut progress, &cancel) {
            Ok(count) => log::info!("[Archive] Restored {} frames for {}", count, name),
            Err(e) => log::warn!("[Archive] Could not restore {}: {}", path.display(), e),
        }
        archive
    }

    /// Close a source: finalize any open recording, persist its archive and release it
    ///
    /// A pending reconnect attempt for the source is abandoned; its outcome is
    /// discarded when it arrives.
    pub fn close_source(&self, id: SourceId) -> Result<()> {
        let session = {
            let _lifecycle = self.lifecycle.lock();
            let mut slots = self.slots.write();
            let slot = slots
                .get_mut(id.index as usize)
                .filter(|s| s.generation == id.generation)
                .ok_or(RegistryError::UnknownSource)?;
            slot.session.take().ok_or(RegistryError::UnknownSource)?
        };

        // Waits for a tick that is processing this session to finish with it
        let mut session = session.lock();
        if session.closed {
            return Err(RegistryError::UnknownSource);
        }
        self.finalize(&mut session, RemovalReason::Closed);
        Ok(())
    }

    /// Close every source and stop the clip writer
    pub fn shutdown(&self) {
        for id in self.source_ids() {
            if let Err(e) = self.close_source(id) {
                log::debug!("[Registry] {} already gone at shutdown: {}", id, e);
            }
        }
        self.clips.shutdown();
    }

    /// Final clip, archive persistence and notification for a departing session
    fn finalize(&self, session: &mut SourceSession, reason: RemovalReason) {
        session.closed = true;
        session.link = LinkState::Removed;
        session.source = None;

        if let Some(interval) = session.trigger.on_disconnect(session.last_good_index) {
            self.submit_clip(session, interval.start, interval.end);
        }
        if let Some(start) = session.manual_start.take() {
            match session.last_good_index {
                Some(end) if end >= start => self.submit_clip(session, start, end),
                _ => log::debug!("[Registry] {} manual recording had no frames", session.name),
            }
        }

        if self.settings.archive.persist_on_close && !session.archive.is_empty() {
            let path = self.layout.archive_path(&session.name);
            if let Err(e) = recording::save_archive(&session.archive, &path) {
                log::warn!("[Archive] Could not persist {}: {}", session.name, e);
            }
        }

        log::info!("[Registry] Removed {} ({:?})", session.name, reason);
        self.events.publish(RegistryEvent::SourceRemoved {
            source: session.name.clone(),
            reason,
        });
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one pass over every source
    pub fn tick(&self) -> TickSummary {
        let mut summary = TickSummary {
            removed: self.apply_reconnect_outcomes(),
            ..TickSummary::default()
        };

        let sessions = self.live_sessions();
        let outcomes = self.run_sessions(&sessions);

        for ((id, _), outcome) in sessions.iter().zip(outcomes) {
            match outcome {
                SessionOutcome::Frame => summary.frames += 1,
                SessionOutcome::Reconnecting => summary.reconnecting += 1,
                SessionOutcome::Removed => {
                    self.release_slot(*id);
                    summary.removed += 1;
                }
                SessionOutcome::Skipped => {}
            }
        }
        summary
    }

    fn run_sessions(&self, sessions: &[(SourceId, Arc<Mutex<SourceSession>>)]) -> Vec<SessionOutcome> {
        let workers = self.settings.detection_workers.min(sessions.len());
        if workers <= 1 {
            return sessions.iter().map(|(_, s)| self.tick_session(s)).collect();
        }

        let chunk = sessions.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = sessions
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|(_, s)| self.tick_session(s))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(sessions.chunks(chunk))
                .flat_map(|(handle, part)| {
                    handle.join().unwrap_or_else(|_| {
                        log::error!("[Registry] Detection worker panicked");
                        part.iter().map(|_| SessionOutcome::Skipped).collect()
                    })
                })
                .collect()
        })
    }

    fn tick_session(&self, session: &Mutex<SourceSession>) -> SessionOutcome {
        let mut session = session.lock();
        if session.closed {
            return SessionOutcome::Skipped;
        }

        match session.link {
            LinkState::Removed => SessionOutcome::Skipped,
            LinkState::Reconnecting { .. } => {
                self.poll_reconnect(&mut session);
                if session.link == LinkState::Removed {
                    self.finalize(&mut session, RemovalReason::ReconnectExhausted);
                    return SessionOutcome::Removed;
                }
                self.publish_placeholder(&session);
                SessionOutcome::Reconnecting
            }
            LinkState::Healthy => {
                let read = match session.source.as_mut() {
                    Some(source) => source.read_frame(),
                    None => Err(DecodeError::Decode("source released".into())),
                };
                match read {
                    Ok(frame) => {
                        self.process_frame(&mut session, frame);
                        SessionOutcome::Frame
                    }
                    Err(e) => {
                        self.begin_reconnect(&mut session, e);
                        if session.link == LinkState::Removed {
                            self.finalize(&mut session, RemovalReason::ReconnectExhausted);
                            return SessionOutcome::Removed;
                        }
                        SessionOutcome::Reconnecting
                    }
                }
            }
        }
    }

    /// read -> detect -> trigger -> archive -> publish, for one healthy frame
    fn process_frame(&self, session: &mut SourceSession, frame: Frame) {
        let processed = self
            .detector
            .process(&frame, session.scale_factor, session.armed);
        let index = session.archive.next_index();

        let action = if session.armed {
            session.trigger.observe(
                index,
                processed.result.has_unmatched(),
                processed.result.face_count() > 0,
            )
        } else {
            TriggerAction::None
        };

        if self.settings.save_unmatched_faces && processed.result.has_unmatched() {
            if let Some(luma) = &processed.luma {
                let faces_dir = self.layout.faces_dir();
                session.save_unmatched_faces(&faces_dir, &processed.result, luma);
            }
        }

        let frame = Arc::new(processed.frame);
        session.archive.append_now(frame.clone());
        session.last_good_index = Some(index);
        session.last_frame = Some(frame.clone());
        session.last_faces = processed.result.face_count();

        match action {
            TriggerAction::None => {}
            TriggerAction::Started { start } => {
                log::info!("[Registry] {} recording started at {} (frame {})", session.name, start, index);
                self.events.publish(RegistryEvent::RecordingStarted {
                    source: session.name.clone(),
                    start_index: start,
                    manual: false,
                });
            }
            TriggerAction::Finished(ClosedInterval { start, end }) => {
                log::info!("[Registry] {} recording finished {}..={}", session.name, start, end);
                self.submit_clip(session, start, end);
            }
        }

        self.events.publish(RegistryEvent::FrameReady {
            source: session.name.clone(),
            frame,
            placeholder: false,
        });
    }

    /// Hand a range to the clip writer, clamping a pruned start to what is still held
    fn submit_clip(&self, session: &SourceSession, start: u64, end: u64) {
        let start = start.max(session.archive.first_index());
        if let Err(e) = self.clips.submit(&session.name, start, end, &session.archive) {
            log::warn!("[Registry] {} clip {}..={} rejected: {}", session.name, start, end, e);
            self.events.publish(RegistryEvent::ClipFailed {
                source: session.name.clone(),
                reason: e.to_string(),
            });
        }
    }

    fn begin_reconnect(&self, session: &mut SourceSession, error: DecodeError) {
        log::warn!("[Registry] {} read failed: {}", session.name, error);
        session.source = None;
        session.link = LinkState::reconnecting(Instant::now());
        self.events.publish(RegistryEvent::SourceReconnecting {
            source: session.name.clone(),
            reason: error.to_string(),
        });
        // First attempt goes out on the same tick
        self.poll_reconnect(session);
        self.publish_placeholder(session);
    }

    fn poll_reconnect(&self, session: &mut SourceSession) {
        let SourceSession {
            id, name, url, link, ..
        } = session;
        self.reconnect.poll(link, *id, name, url, Instant::now());
    }

    fn publish_placeholder(&self, session: &SourceSession) {
        self.events.publish(RegistryEvent::FrameReady {
            source: session.name.clone(),
            frame: session.display_frame(),
            placeholder: true,
        });
    }

    /// Returns how many sources were removed
    fn apply_reconnect_outcomes(&self) -> usize {
        let mut removed = 0;
        for outcome in self.reconnect.drain() {
            let Some(handle) = self.resolve(outcome.source) else {
                log::debug!("[Reconnect] Discarding outcome for closed source {}", outcome.source);
                continue;
            };
            let mut session = handle.lock();
            if session.closed || !session.link.is_reconnecting() {
                continue;
            }

            match outcome.result {
                Ok(source) => {
                    log::info!(
                        "[Reconnect] {} reconnected after {} failed attempts",
                        session.name,
                        session.link.attempts()
                    );
                    session.source = Some(source);
                    session.link = LinkState::Healthy;
                    self.events.publish(RegistryEvent::SourceOpened {
                        source: session.name.clone(),
                    });
                }
                Err(e) => {
                    log::warn!("[Reconnect] {} open failed: {}", session.name, e);
                    let name = session.name.clone();
                    let exhausted = self.reconnect.record_failure(&mut session.link, &name, Instant::now());
                    if exhausted {
                        self.finalize(&mut session, RemovalReason::ReconnectExhausted);
                        drop(session);
                        self.release_slot(outcome.source);
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Block until every reconnect attempt in flight has reported (or `timeout`)
    pub fn wait_for_reconnects(&self, timeout: Duration) -> bool {
        self.reconnect.wait_idle(timeout)
    }

    // ========================================================================
    // Slot table
    // ========================================================================

    fn resolve(&self, id: SourceId) -> Option<Arc<Mutex<SourceSession>>> {
        let slots = self.slots.read();
        slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.session.clone())
    }

    fn live_sessions(&self) -> Vec<(SourceId, Arc<Mutex<SourceSession>>)> {
        let slots = self.slots.read();
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.session
                    .clone()
                    .map(|s| (SourceId::new(index as u32, slot.generation), s))
            })
            .collect()
    }

    fn release_slot(&self, id: SourceId) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
        {
            slot.session = None;
        }
    }

    fn with_session<T>(&self, id: SourceId, f: impl FnOnce(&mut SourceSession) -> Result<T>) -> Result<T> {
        let handle = self.resolve(id).ok_or(RegistryError::UnknownSource)?;
        let mut session = handle.lock();
        if session.closed {
            return Err(RegistryError::UnknownSource);
        }
        f(&mut session)
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.live_sessions().into_iter().map(|(id, _)| id).collect()
    }

    pub fn find(&self, name: &str) -> Option<SourceId> {
        self.live_sessions()
            .into_iter()
            .find(|(_, s)| {
                let s = s.lock();
                !s.closed && s.name == name
            })
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.source_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Operator commands
    // ========================================================================

    pub fn set_armed(&self, id: SourceId, armed: bool) -> Result<()> {
        self.with_session(id, |s| {
            if s.armed && !armed {
                // Disarming ends an automatic recording at the last archived frame
                if let Some(interval) = s.trigger.on_disconnect(s.last_good_index) {
                    self.submit_clip(s, interval.start, interval.end);
                }
            }
            s.armed = armed;
            log::info!("[Registry] {} {}", s.name, if armed { "armed" } else { "disarmed" });
            Ok(())
        })
    }

    pub fn set_scale_factor(&self, id: SourceId, scale_factor: f32) -> Result<()> {
        validate_scale(scale_factor)?;
        self.with_session(id, |s| {
            s.scale_factor = scale_factor;
            Ok(())
        })
    }

    /// Start recording from the next frame on, independent of detection
    pub fn start_manual_recording(&self, id: SourceId) -> Result<u64> {
        self.with_session(id, |s| {
            if s.manual_start.is_some() {
                return Err(RegistryError::AlreadyRecording);
            }
            let start = s.archive.next_index();
            s.manual_start = Some(start);
            log::info!("[Registry] {} manual recording started at {}", s.name, start);
            self.events.publish(RegistryEvent::RecordingStarted {
                source: s.name.clone(),
                start_index: start,
                manual: true,
            });
            Ok(start)
        })
    }

    /// Stop the manual recording and queue its clip. Returns the interval.
    pub fn stop_manual_recording(&self, id: SourceId) -> Result<ClosedInterval> {
        self.with_session(id, |s| {
            let begun = s.manual_start.ok_or(RegistryError::NotRecording)?;
            let end = s.archive.latest_index().unwrap_or(0);
            let start = begun.max(s.archive.first_index());
            // Stays open when the clip is refused, so the stop can be retried
            self.clips.submit(&s.name, start, end, &s.archive)?;
            s.manual_start = None;
            log::info!("[Registry] {} manual recording {}..={} queued", s.name, start, end);
            Ok(ClosedInterval { start, end })
        })
    }

    /// Queue an operator-selected archive range as a clip
    pub fn export_range(&self, id: SourceId, start: u64, end: u64) -> Result<()> {
        self.with_session(id, |s| {
            self.clips.submit(&s.name, start, end, &s.archive)?;
            Ok(())
        })
    }

    /// Persist one source's archive now
    pub fn save_archive(&self, id: SourceId) -> Result<std::path::PathBuf> {
        self.with_session(id, |s| {
            let path = self.layout.archive_path(&s.name);
            recording::save_archive(&s.archive, &path)?;
            Ok(path)
        })
    }

    /// Drop archived frames dated before `older_than` on every source
    pub fn prune_archives(&self, older_than: NaiveDate) -> usize {
        let mut total = 0;
        for (_, handle) in self.live_sessions() {
            let mut session = handle.lock();
            if session.closed {
                continue;
            }
            let removed = session.archive.prune(older_than);
            if removed > 0 {
                log::info!("[Archive] Pruned {} frames from {}", removed, session.name);
            }
            total += removed;
        }
        total
    }

    pub fn archive_dates(&self, id: SourceId) -> Result<Vec<NaiveDate>> {
        self.with_session(id, |s| Ok(s.archive.dates()))
    }

    pub fn archive_date_span(&self, id: SourceId, date: NaiveDate) -> Result<Option<(u64, u64)>> {
        self.with_session(id, |s| Ok(s.archive.date_span(date)))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Latest frame of a source; a placeholder while it is not healthy
    pub fn latest_frame(&self, id: SourceId) -> Result<Arc<Frame>> {
        self.with_session(id, |s| Ok(s.display_frame()))
    }

    pub fn snapshot(&self, id: SourceId) -> Result<SessionSnapshot> {
        self.with_session(id, |s| Ok(s.snapshot()))
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.live_sessions()
            .into_iter()
            .filter_map(|(_, handle)| {
                let session = handle.lock();
                (!session.closed).then(|| session.snapshot())
            })
            .collect()
    }
}

fn validate_scale(scale_factor: f32) -> Result<()> {
    if scale_factor.is_finite() && scale_factor > 0.0 {
        Ok(())
    } else {
        Err(RegistryError::InvalidScale(scale_factor))
    }
}

//! Asynchronous clip writer
//!
//! The tick thread hands over a [`ClipJob`], a copy of the archived frame
//! range taken while the session lock is held, and returns immediately. A
//! single background thread encodes the jobs in order, appends each finished
//! clip to the recording log and publishes the outcome on the event bus.
//!
//! The archive is never borrowed across the encode: the snapshot owns
//! `Arc<Frame>` handles, so pruning or eviction while a clip is being written
//! does not affect it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use super::{ClipEncoder, ClipError, RecordingEvent, Result};
use crate::notifications::{EventBus, RegistryEvent};
use crate::recording::{FrameArchive, FrameRecord};
use crate::session::{sanitize_name, unique_path, EventLog};

/// A validated, self-contained frame range ready to encode
pub struct ClipJob {
    source: String,
    start: u64,
    end: u64,
    frames: Vec<FrameRecord>,
}

impl ClipJob {
    /// Copy `start..=end` out of `archive`
    ///
    /// Rejects inverted ranges and ranges not fully retained by the archive.
    pub fn snapshot(source: &str, start: u64, end: u64, archive: &FrameArchive) -> Result<Self> {
        let frames = archive.range(start, end).ok_or(ClipError::InvalidRange {
            start,
            end,
            first: archive.first_index(),
            next: archive.next_index(),
        })?;
        Ok(Self {
            source: source.to_string(),
            start,
            end,
            frames,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Messages sent to the writer thread
enum ClipMessage {
    Job(ClipJob),
    Finish,
}

/// Everything the writer thread needs, shared with synchronous writes
struct ClipContext {
    encoder: Arc<dyn ClipEncoder>,
    output_dir: PathBuf,
    log: Arc<EventLog>,
    events: EventBus,
    fps: u32,
    /// Jobs accepted but not yet finished
    pending: Mutex<usize>,
    idle: Condvar,
}

impl ClipContext {
    fn write(&self, job: ClipJob) -> Result<RecordingEvent> {
        let (first, last) = match (job.frames.first(), job.frames.last()) {
            (Some(first), Some(last)) => (first.timestamp(), last.timestamp()),
            _ => return Err(ClipError::Encode("empty frame range".into())),
        };

        std::fs::create_dir_all(&self.output_dir)?;
        let stem = format!(
            "{}_{}_{}_{}",
            sanitize_name(&job.source),
            first.format("%Y-%m-%d"),
            first.format("%H%M%S"),
            last.format("%H%M%S"),
        );
        let path = unique_path(&self.output_dir, &stem, self.encoder.extension());

        let started = Instant::now();
        if let Err(e) = self.encoder.encode(&path, &job.frames, self.fps) {
            remove_partial(&path);
            return Err(e);
        }

        let id = match self.log.insert_recording(&job.source, &path, first, last) {
            Ok(id) => id,
            Err(e) => {
                // Every clip on disk has a log row
                remove_partial(&path);
                return Err(ClipError::Log(e.to_string()));
            }
        };

        log::info!(
            "[Clip] {} frames {}..={} -> {} ({} frames in {:.1}s)",
            job.source,
            job.start,
            job.end,
            path.display(),
            job.frames.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(RecordingEvent {
            id,
            source: job.source,
            path,
            start: first,
            end: last,
            frame_count: job.frames.len(),
        })
    }

    fn publish(&self, source: &str, outcome: &Result<RecordingEvent>) {
        match outcome {
            Ok(event) => self.events.publish(RegistryEvent::RecordingFinished(event.clone())),
            Err(e) => {
                log::warn!("[Clip] Clip for {} failed: {}", source, e);
                self.events.publish(RegistryEvent::ClipFailed {
                    source: source.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn job_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("[Clip] Could not remove partial clip {}: {}", path.display(), e);
        }
    }
}

/// Background clip writer
///
/// Jobs are queued on a bounded channel; when the queue is full new jobs are
/// rejected with [`ClipError::QueueFull`] instead of stalling the caller.
pub struct ClipWriter {
    jobs: Sender<ClipMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    context: Arc<ClipContext>,
}

impl ClipWriter {
    pub fn new(
        encoder: Arc<dyn ClipEncoder>,
        output_dir: PathBuf,
        log: Arc<EventLog>,
        events: EventBus,
        fps: u32,
        queue_capacity: usize,
    ) -> Result<Self> {
        let (jobs, receiver) = bounded::<ClipMessage>(queue_capacity.max(1));
        let context = Arc::new(ClipContext {
            encoder,
            output_dir,
            log,
            events,
            fps: fps.max(1),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let worker_context = context.clone();
        let worker = std::thread::Builder::new()
            .name("vigil-clip-writer".into())
            .spawn(move || writer_thread_main(receiver, worker_context))
            .map_err(|e| ClipError::EncoderOpenFailed(format!("Failed to spawn clip writer: {}", e)))?;

        Ok(Self {
            jobs,
            worker: Mutex::new(Some(worker)),
            context,
        })
    }

    /// Snapshot `start..=end` from `archive` and queue it for encoding
    pub fn submit(&self, source: &str, start: u64, end: u64, archive: &FrameArchive) -> Result<()> {
        let job = ClipJob::snapshot(source, start, end, archive)?;
        self.enqueue(job)
    }

    /// Queue an already captured job
    pub fn enqueue(&self, job: ClipJob) -> Result<()> {
        *self.context.pending.lock() += 1;
        let source = job.source.clone();
        match self.jobs.try_send(ClipMessage::Job(job)) {
            Ok(()) => {
                log::debug!("[Clip] Queued clip for {}", source);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.context.job_done();
                Err(ClipError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.context.job_done();
                Err(ClipError::Encode("clip writer has shut down".into()))
            }
        }
    }

    /// Encode `start..=end` on the calling thread
    ///
    /// Same contract as the queued path: the clip is logged and the outcome is
    /// published, and an invalid range writes nothing.
    pub fn write(
        &self,
        source: &str,
        start: u64,
        end: u64,
        archive: &FrameArchive,
    ) -> Result<RecordingEvent> {
        let job = ClipJob::snapshot(source, start, end, archive)?;
        let source = job.source.clone();
        let outcome = self.context.write(job);
        self.context.publish(&source, &outcome);
        outcome
    }

    /// Number of queued or in-progress jobs
    pub fn pending(&self) -> usize {
        *self.context.pending.lock()
    }

    /// Block until every accepted job has finished or `timeout` elapses.
    /// Returns true if the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.context.pending.lock();
        while *pending > 0 {
            if self.context.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    pub fn output_dir(&self) -> &Path {
        &self.context.output_dir
    }

    /// Finish queued jobs and stop the writer thread
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        // Finish is queued behind any pending jobs, so they are written first
        let _ = self.jobs.send(ClipMessage::Finish);
        if handle.join().is_err() {
            log::error!("[Clip] Clip writer thread panicked");
        }
    }
}

impl Drop for ClipWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_thread_main(receiver: Receiver<ClipMessage>, context: Arc<ClipContext>) {
    log::debug!("[Clip] Writer thread started");
    loop {
        match receiver.recv() {
            Ok(ClipMessage::Job(job)) => {
                let source = job.source.clone();
                let outcome = context.write(job);
                context.publish(&source, &outcome);
                context.job_done();
            }
            Ok(ClipMessage::Finish) | Err(_) => break,
        }
    }
    log::debug!("[Clip] Writer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use crate::encoding::testing::{read_frame_list, FrameListEncoder};
    use chrono::{NaiveDate, NaiveTime};

    fn archive_with(count: u32) -> FrameArchive {
        let mut archive = FrameArchive::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        for i in 0..count {
            let time = NaiveTime::from_hms_opt(12, 0, i).unwrap();
            archive.append(FrameRecord::new(date, time, Arc::new(Frame::placeholder(16, 12))));
        }
        archive
    }

    struct Fixture {
        dir: tempfile::TempDir,
        log: Arc<EventLog>,
        events: EventBus,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                log: Arc::new(EventLog::open_in_memory().unwrap()),
                events: EventBus::new(),
            }
        }

        fn writer(&self, encoder: Arc<dyn ClipEncoder>) -> ClipWriter {
            ClipWriter::new(
                encoder,
                self.dir.path().join("Recordings"),
                self.log.clone(),
                self.events.clone(),
                30,
                4,
            )
            .unwrap()
        }

        fn clip_files(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("Recordings"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    struct FailingEncoder;

    impl ClipEncoder for FailingEncoder {
        fn extension(&self) -> &'static str {
            "avi"
        }

        fn encode(&self, path: &Path, _frames: &[FrameRecord], _fps: u32) -> Result<()> {
            std::fs::write(path, b"half a clip")?;
            Err(ClipError::Encode("disk on fire".into()))
        }
    }

    #[test]
    fn invalid_ranges_write_nothing() {
        let fx = Fixture::new();
        let writer = fx.writer(Arc::new(FrameListEncoder));
        let archive = archive_with(10);

        let inverted = writer.write("porch", 5, 4, &archive);
        assert!(matches!(inverted, Err(ClipError::InvalidRange { .. })));

        let past_end = writer.submit("porch", 3, 10, &archive);
        assert!(matches!(past_end, Err(ClipError::InvalidRange { start: 3, end: 10, first: 0, next: 10 })));

        assert!(writer.wait_idle(Duration::from_secs(5)));
        assert_eq!(fx.clip_files(), 0);
        assert_eq!(fx.log.recording_count().unwrap(), 0);
    }

    #[test]
    fn queued_clip_is_written_logged_and_published() {
        let fx = Fixture::new();
        let rx = fx.events.subscribe(8);
        let writer = fx.writer(Arc::new(FrameListEncoder));
        let archive = archive_with(10);

        writer.submit("Front Door", 2, 6, &archive).unwrap();
        assert!(writer.wait_idle(Duration::from_secs(10)));

        let rows = fx.log.recent_recordings(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].camera_name, "Front Door");
        assert_eq!(rows[0].file_name, "Front_Door_2024-03-09_120002_120006.frames");
        assert_eq!(rows[0].start_time, "2024-03-09 12:00:02");

        match rx.try_recv() {
            Ok(RegistryEvent::RecordingFinished(event)) => {
                assert_eq!(event.frame_count, 5);
                assert_eq!(read_frame_list(&event.path), vec!["16x12"; 5]);
                assert_eq!(event.id, rows[0].id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn same_interval_twice_gets_distinct_files() {
        let fx = Fixture::new();
        let writer = fx.writer(Arc::new(FrameListEncoder));
        let archive = archive_with(4);

        let a = writer.write("yard", 0, 3, &archive).unwrap();
        let b = writer.write("yard", 0, 3, &archive).unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(fx.clip_files(), 2);
    }

    #[test]
    fn encoder_failure_removes_partial_file() {
        let fx = Fixture::new();
        let rx = fx.events.subscribe(8);
        let writer = fx.writer(Arc::new(FailingEncoder));
        let archive = archive_with(3);

        writer.submit("gate", 0, 2, &archive).unwrap();
        assert!(writer.wait_idle(Duration::from_secs(5)));

        assert_eq!(fx.clip_files(), 0);
        assert_eq!(fx.log.recording_count().unwrap(), 0);
        assert!(matches!(rx.try_recv(), Ok(RegistryEvent::ClipFailed { .. })));
    }

    #[test]
    fn log_failure_removes_the_written_clip() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("vigil.db");
        let log = Arc::new(EventLog::open(&db).unwrap());
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute("DROP TABLE camera_logs", [])
            .unwrap();

        let events = EventBus::new();
        let rx = events.subscribe(8);
        let writer = ClipWriter::new(
            Arc::new(FrameListEncoder),
            dir.path().join("Recordings"),
            log,
            events,
            30,
            4,
        )
        .unwrap();
        let archive = archive_with(3);

        assert!(matches!(writer.write("gate", 0, 2, &archive), Err(ClipError::Log(_))));
        writer.submit("gate", 0, 2, &archive).unwrap();
        assert!(writer.wait_idle(Duration::from_secs(5)));

        let left = std::fs::read_dir(dir.path().join("Recordings")).unwrap().count();
        assert_eq!(left, 0);
        assert!(matches!(rx.try_recv(), Ok(RegistryEvent::ClipFailed { .. })));
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let fx = Fixture::new();
        let writer = fx.writer(Arc::new(FrameListEncoder));
        let archive = archive_with(6);

        writer.submit("a", 0, 2, &archive).unwrap();
        writer.submit("b", 3, 5, &archive).unwrap();
        writer.shutdown();

        assert_eq!(fx.log.recording_count().unwrap(), 2);
        assert!(writer.submit("c", 0, 1, &archive).is_err());
    }

    #[test]
    fn snapshot_survives_archive_pruning() {
        let mut archive = archive_with(5);
        let job = ClipJob::snapshot("porch", 1, 3, &archive).unwrap();
        assert_eq!(archive.prune(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()), 5);
        assert!(archive.is_empty());
        assert_eq!(job.frame_count(), 3);
        assert_eq!((job.start(), job.end(), job.source()), (1, 3, "porch"));
    }
}

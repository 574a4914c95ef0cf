// Periodic driver: runs the registry tick on its own thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;

use super::CameraRegistry;
use crate::config::ArchiveSettings;

/// Longest single sleep, so a stop request is noticed promptly
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Owns the `vigil-tick` thread
pub struct TickDriver {
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TickDriver {
    /// Start ticking `registry` every `interval`, pruning archives per `archive`
    pub fn spawn(
        registry: Arc<CameraRegistry>,
        interval: Duration,
        archive: ArchiveSettings,
    ) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let thread = std::thread::Builder::new()
            .name("vigil-tick".into())
            .spawn(move || tick_loop(registry, interval, archive, flag))?;

        Ok(Self {
            stop_flag,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Ask the thread to stop and wait for its current tick to finish
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[Registry] Tick thread panicked");
            }
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick_loop(
    registry: Arc<CameraRegistry>,
    interval: Duration,
    archive: ArchiveSettings,
    stop_flag: Arc<AtomicBool>,
) {
    let prune_every = Duration::from_secs(archive.prune_interval_secs.max(1));
    let mut last_prune = Instant::now();
    let mut ticks: u64 = 0;

    log::info!("[Registry] Tick driver started ({:?} interval)", interval);

    while !stop_flag.load(Ordering::Relaxed) {
        let started = Instant::now();

        let summary = registry.tick();
        ticks = ticks.wrapping_add(1);
        if summary.removed > 0 || summary.reconnecting > 0 {
            log::debug!("[Registry] Tick {}: {:?}", ticks, summary);
        }

        if last_prune.elapsed() >= prune_every {
            last_prune = Instant::now();
            let cutoff = Local::now().date_naive() - chrono::Duration::days(archive.retention_days as i64);
            let pruned = registry.prune_archives(cutoff);
            log::info!("[Archive] Daily prune before {}: {} frames dropped", cutoff, pruned);
        }

        // Sleep out the rest of the interval in short slices
        let mut remaining = interval.saturating_sub(started.elapsed());
        while !remaining.is_zero() && !stop_flag.load(Ordering::Relaxed) {
            let slice = remaining.min(MAX_SLEEP);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }

    log::info!("[Registry] Tick driver stopped after {} ticks", ticks);
}

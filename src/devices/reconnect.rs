// Reconnection of sources that stopped delivering frames
//
// Each attempt runs `SourceOpener::open` on its own short-lived thread, so a
// hanging network source only ever blocks that thread (and the opener bounds
// it with its open timeout). Outcomes come back over a channel that the
// registry drains at the start of every tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::capture::{DecodeError, FrameSource, SourceOpener};
use crate::config::ReconnectSettings;
use crate::registry::SourceId;

/// Connection lifecycle of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    /// Frames are read and processed every tick
    Healthy,
    /// Excluded from frame processing until an open succeeds
    Reconnecting {
        /// Failed opens so far
        attempts: u32,
        #[serde(skip)]
        next_attempt: Instant,
        /// An open is running on a reconnect thread
        in_flight: bool,
    },
    /// Gave up; the registry drops the session
    Removed,
}

impl LinkState {
    /// State right after a read failure: first attempt due immediately
    pub fn reconnecting(now: Instant) -> Self {
        LinkState::Reconnecting {
            attempts: 0,
            next_attempt: now,
            in_flight: false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, LinkState::Healthy)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, LinkState::Reconnecting { .. })
    }

    /// Failed opens so far
    pub fn attempts(&self) -> u32 {
        match self {
            LinkState::Reconnecting { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Wait before the attempt following `failed` failures
    pub fn backoff(&self, failed: u32) -> Duration {
        if failed == 0 {
            return Duration::ZERO;
        }
        let shift = (failed - 1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failed: u32) -> bool {
        failed >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

/// Result of one open attempt, reported back to the registry
pub struct ReconnectOutcome {
    pub source: SourceId,
    pub result: Result<Box<dyn FrameSource>, DecodeError>,
}

pub struct ReconnectionManager {
    opener: Arc<dyn SourceOpener>,
    policy: ReconnectPolicy,
    outcome_tx: Sender<ReconnectOutcome>,
    outcome_rx: Receiver<ReconnectOutcome>,
    /// Attempts whose outcome has not been drained yet
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl ReconnectionManager {
    pub fn new(opener: Arc<dyn SourceOpener>, policy: ReconnectPolicy) -> Self {
        let (outcome_tx, outcome_rx) = unbounded();
        Self {
            opener,
            policy,
            outcome_tx,
            outcome_rx,
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Issue the next attempt for `source` if one is due
    ///
    /// Returns true if an attempt was started.
    pub fn poll(
        &self,
        state: &mut LinkState,
        source: SourceId,
        name: &str,
        url: &str,
        now: Instant,
    ) -> bool {
        let LinkState::Reconnecting {
            attempts,
            next_attempt,
            in_flight,
        } = state
        else {
            return false;
        };
        if *in_flight || now < *next_attempt {
            return false;
        }
        log::info!(
            "[Reconnect] {} attempt {}/{}",
            name,
            *attempts + 1,
            self.policy.max_attempts
        );
        if self.begin_attempt(source, name, url) {
            *in_flight = true;
            true
        } else {
            // Could not even spawn; count it as a failed open
            self.record_failure(state, name, now);
            false
        }
    }

    /// Apply a failed open to `state`. Returns true if the source is now removed.
    pub fn record_failure(&self, state: &mut LinkState, name: &str, now: Instant) -> bool {
        let failed = state.attempts() + 1;
        if self.policy.exhausted(failed) {
            log::warn!("[Reconnect] {} gave up after {} attempts", name, failed);
            *state = LinkState::Removed;
            return true;
        }
        let wait = self.policy.backoff(failed);
        log::debug!("[Reconnect] {} retrying in {:?}", name, wait);
        *state = LinkState::Reconnecting {
            attempts: failed,
            next_attempt: now + wait,
            in_flight: false,
        };
        false
    }

    /// Spawn one open attempt. The outcome arrives through `drain`.
    pub fn begin_attempt(&self, source: SourceId, name: &str, url: &str) -> bool {
        let opener = self.opener.clone();
        let tx = self.outcome_tx.clone();
        let url = url.to_string();
        let in_flight = self.in_flight.clone();

        *in_flight.0.lock() += 1;
        let spawned = std::thread::Builder::new()
            .name(format!("vigil-reconnect-{}", name))
            .spawn(move || {
                let result = opener.open(&url);
                // The receiver lives as long as the manager
                let _ = tx.send(ReconnectOutcome { source, result });
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                log::error!("[Reconnect] Failed to spawn reconnect thread for {}: {}", name, e);
                self.settle(1);
                false
            }
        }
    }

    /// Outcomes that arrived since the last call
    pub fn drain(&self) -> Vec<ReconnectOutcome> {
        let outcomes: Vec<ReconnectOutcome> = self.outcome_rx.try_iter().collect();
        if !outcomes.is_empty() {
            self.settle(outcomes.len());
        }
        outcomes
    }

    /// Attempts started and not yet drained
    pub fn in_flight(&self) -> usize {
        *self.in_flight.0.lock()
    }

    /// Block until every started attempt has reported, or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let reported = self.outcome_rx.len();
            let (lock, cvar) = &*self.in_flight;
            let mut pending = lock.lock();
            if *pending <= reported {
                return true;
            }
            // Outcomes arrive on the channel, not through the condvar; poll it
            let step = Duration::from_millis(5).min(deadline.saturating_duration_since(Instant::now()));
            if step.is_zero() {
                return false;
            }
            cvar.wait_for(&mut pending, step);
        }
    }

    fn settle(&self, count: usize) {
        let (lock, cvar) = &*self.in_flight;
        let mut pending = lock.lock();
        *pending = pending.saturating_sub(count);
        cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use std::collections::VecDeque;

    struct Still;

    impl FrameSource for Still {
        fn read_frame(&mut self) -> Result<Frame, DecodeError> {
            Ok(Frame::placeholder(4, 4))
        }
    }

    /// Opens succeed or fail in the scripted order, then keep failing
    struct ScriptedOpener {
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedOpener {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
            })
        }
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, DecodeError> {
            if self.script.lock().pop_front().unwrap_or(false) {
                Ok(Box::new(Still))
            } else {
                Err(DecodeError::OpenFailed(url.to_string()))
            }
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::ZERO);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }

    #[test]
    fn first_attempt_is_issued_immediately_and_reports_back() {
        let manager = ReconnectionManager::new(ScriptedOpener::new(&[true]), policy());
        let id = SourceId::new(0, 1);
        let now = Instant::now();
        let mut state = LinkState::reconnecting(now);

        assert!(manager.poll(&mut state, id, "porch", "rtsp://porch", now));
        assert!(matches!(state, LinkState::Reconnecting { in_flight: true, .. }));
        // Already in flight: no second attempt
        assert!(!manager.poll(&mut state, id, "porch", "rtsp://porch", now));

        assert!(manager.wait_idle(Duration::from_secs(5)));
        let outcomes = manager.drain();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].source, id);
        assert!(outcomes[0].result.is_ok());
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn failures_back_off_then_remove() {
        let manager = ReconnectionManager::new(ScriptedOpener::new(&[]), policy());
        let now = Instant::now();
        let mut state = LinkState::reconnecting(now);

        assert!(!manager.record_failure(&mut state, "yard", now));
        match state {
            LinkState::Reconnecting { attempts, next_attempt, in_flight } => {
                assert_eq!(attempts, 1);
                assert_eq!(next_attempt, now + Duration::from_millis(100));
                assert!(!in_flight);
            }
            other => panic!("unexpected state {:?}", other),
        }

        // Not due yet
        assert!(!manager.poll(&mut state, SourceId::new(0, 1), "yard", "x", now));

        assert!(!manager.record_failure(&mut state, "yard", now));
        assert!(manager.record_failure(&mut state, "yard", now));
        assert_eq!(state, LinkState::Removed);
    }

    #[test]
    fn healthy_sources_are_never_polled() {
        let manager = ReconnectionManager::new(ScriptedOpener::new(&[true]), policy());
        let mut state = LinkState::Healthy;
        assert!(!manager.poll(&mut state, SourceId::new(2, 1), "gate", "x", Instant::now()));
        assert_eq!(manager.in_flight(), 0);
    }
}

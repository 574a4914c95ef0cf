// Per-source recording trigger
//
// Turns per-frame detection outcomes into closed recording intervals over
// archive indices. The trigger never touches frames itself; it only decides
// which range of the archive becomes a clip.

use serde::Serialize;

use crate::config::TriggerSettings;

/// Where the trigger currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TriggerPhase {
    /// Nothing happening
    Idle,
    /// A recording is open and started at `start`
    Recording { start: u64 },
    /// A recording just closed at `until`; new ones are held off
    Cooldown { until: u64 },
}

/// A finished recording interval (inclusive archive indices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClosedInterval {
    pub start: u64,
    pub end: u64,
}

/// What a single observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    None,
    Started { start: u64 },
    Finished(ClosedInterval),
}

pub struct RecordingTrigger {
    settings: TriggerSettings,
    phase: TriggerPhase,
    /// Set once an unmatched face opened the current (or last) recording
    presence_active: bool,
    last_interval: Option<ClosedInterval>,
    /// End of the last recording; 0 means no cooldown is in force
    cooldown_until: u64,
}

impl RecordingTrigger {
    pub fn new(settings: TriggerSettings) -> Self {
        Self {
            settings,
            phase: TriggerPhase::Idle,
            presence_active: false,
            last_interval: None,
            cooldown_until: 0,
        }
    }

    pub fn phase(&self) -> TriggerPhase {
        self.phase
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.phase, TriggerPhase::Recording { .. })
    }

    pub fn presence_active(&self) -> bool {
        self.presence_active
    }

    pub fn recording_start(&self) -> Option<u64> {
        match self.phase {
            TriggerPhase::Recording { start } => Some(start),
            _ => self.last_interval.map(|i| i.start),
        }
    }

    pub fn recording_end(&self) -> Option<u64> {
        self.last_interval.map(|i| i.end)
    }

    pub fn cooldown_until(&self) -> u64 {
        self.cooldown_until
    }

    /// True while `index` falls inside the cooldown window of the last recording
    pub fn in_cooldown(&self, index: u64) -> bool {
        self.cooldown_until != 0
            && index.saturating_sub(self.cooldown_until) <= self.settings.cooldown_frames
    }

    /// Feed the detection outcome for the frame about to be archived at `index`.
    ///
    /// `unmatched_face` opens a recording; `face_present` (matched or not) keeps one open.
    pub fn observe(&mut self, index: u64, unmatched_face: bool, face_present: bool) -> TriggerAction {
        match self.phase {
            TriggerPhase::Idle | TriggerPhase::Cooldown { .. } => {
                if self.in_cooldown(index) {
                    return TriggerAction::None;
                }
                self.phase = TriggerPhase::Idle;
                if unmatched_face {
                    let start = index.saturating_sub(self.settings.lead_in_frames);
                    self.phase = TriggerPhase::Recording { start };
                    self.presence_active = true;
                    return TriggerAction::Started { start };
                }
                TriggerAction::None
            }
            TriggerPhase::Recording { start } => {
                if face_present || index < start + self.settings.leave_after_frames {
                    return TriggerAction::None;
                }
                let end = index.saturating_sub(self.settings.trailing_trim_frames);
                TriggerAction::Finished(self.close(start, end))
            }
        }
    }

    /// The source went away or was disarmed. An open recording ends at the
    /// last archived index and its cooldown still applies.
    pub fn on_disconnect(&mut self, last_good: Option<u64>) -> Option<ClosedInterval> {
        let interval = match (self.phase, last_good) {
            (TriggerPhase::Recording { start }, Some(end)) => Some(self.close(start, end)),
            (TriggerPhase::Recording { .. }, None) => {
                self.phase = TriggerPhase::Idle;
                None
            }
            _ => None,
        };
        self.presence_active = false;
        interval
    }

    fn close(&mut self, start: u64, end: u64) -> ClosedInterval {
        let interval = ClosedInterval { start, end };
        self.last_interval = Some(interval);
        self.cooldown_until = end;
        self.presence_active = false;
        self.phase = TriggerPhase::Cooldown { until: end };
        interval
    }
}

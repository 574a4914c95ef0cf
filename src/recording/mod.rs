// Recording modules: trigger state machine, frame archive and its file format

pub mod archive;
pub mod persist;
pub mod trigger;

pub use archive::{FrameArchive, FrameRecord};
pub use persist::{load_archive, restore_into, save_archive, ArchiveError};
pub use trigger::{ClosedInterval, RecordingTrigger, TriggerAction, TriggerPhase};

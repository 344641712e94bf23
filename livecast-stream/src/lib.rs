//! HLS broadcast pipeline: output layout, storage providers, the segment
//! relay between transcoder staging and storage, and the stream lifecycle
//! controller that ties them together.

pub mod layout;
pub mod lifecycle;
pub mod relay;
pub mod storage;
pub mod transcoder;

pub use layout::OutputLayout;
pub use lifecycle::{
    BroadcastState, Broadcaster, ControllerHandle, ControllerPhase, LiveSource, Status,
    StatusReader, StreamController, StreamDetails, Transition,
};
pub use relay::{RelayStats, SegmentRelay};
pub use storage::{build_provider, StorageError, StorageKind, StorageProvider};
pub use transcoder::{FfmpegTranscoder, InputKind, TranscodeHandle, TranscodeJob, Transcoder};

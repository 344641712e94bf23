// Stream lifecycle
//
// Initializing -> Offline <-> Live -> ShuttingDown
//
// All transitions run on one controller task fed by a command queue; the
// ingest side and the process entry point talk to it through a cloneable
// `ControllerHandle`.

pub mod controller;
pub mod status;

use serde::Serialize;

pub use controller::{ControllerHandle, LiveSource, StreamController, Transition};
pub use status::{Broadcaster, Status, StatusReader, StreamDetails};

/// What viewers are currently being served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastState {
    Offline,
    Live,
}

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Initializing,
    Offline,
    Live,
    ShuttingDown,
}

impl ControllerPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Offline => "offline",
            Self::Live => "live",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

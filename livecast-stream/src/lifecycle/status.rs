// Broadcast status shared with read-only collaborators (directory listing,
// status endpoints). Every transition commits all of its fields under one
// write lock, so readers never see a half-applied transition.

use super::BroadcastState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Technical details reported by the ingest for the inbound stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamDetails {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<f32>,
    pub video_bitrate_kbps: Option<u32>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

/// Who is currently broadcasting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Broadcaster {
    pub remote_addr: String,
    pub started_at: DateTime<Utc>,
    pub details: StreamDetails,
}

impl Broadcaster {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            started_at: Utc::now(),
            details: StreamDetails::default(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: StreamDetails) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Status {
    pub online: bool,
    pub viewer_count: u64,
    /// Peak viewers since the current broadcast started
    pub session_max_viewer_count: u64,
    /// Peak viewers since process start
    pub overall_max_viewer_count: u64,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub broadcaster: Option<Broadcaster>,
}

impl Status {
    #[must_use]
    pub fn state(&self) -> BroadcastState {
        if self.online {
            BroadcastState::Live
        } else {
            BroadcastState::Offline
        }
    }
}

/// Read-only view handed to collaborators
#[derive(Debug, Clone)]
pub struct StatusReader {
    inner: Arc<RwLock<Status>>,
}

impl StatusReader {
    #[must_use]
    pub fn snapshot(&self) -> Status {
        self.inner.read().clone()
    }

    #[must_use]
    pub fn state(&self) -> BroadcastState {
        self.inner.read().state()
    }

    #[must_use]
    pub fn broadcaster(&self) -> Option<Broadcaster> {
        self.inner.read().broadcaster.clone()
    }
}

/// Writable status, owned by the controller
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusBoard {
    inner: Arc<RwLock<Status>>,
}

impl StatusBoard {
    pub(crate) fn reader(&self) -> StatusReader {
        StatusReader {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn go_live(&self, broadcaster: Broadcaster) {
        let mut status = self.inner.write();
        status.online = true;
        status.last_connect_time = Some(Utc::now());
        status.session_max_viewer_count = status.viewer_count;
        status.broadcaster = Some(broadcaster);
    }

    pub(crate) fn go_offline(&self) {
        let mut status = self.inner.write();
        status.online = false;
        status.last_disconnect_time = Some(Utc::now());
        status.broadcaster = None;
    }

    pub(crate) fn record_viewer_count(&self, count: u64) {
        let mut status = self.inner.write();
        status.viewer_count = count;
        if status.online {
            status.session_max_viewer_count = status.session_max_viewer_count.max(count);
        }
        status.overall_max_viewer_count = status.overall_max_viewer_count.max(count);
    }
}

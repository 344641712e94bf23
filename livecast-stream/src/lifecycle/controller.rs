// Stream lifecycle controller
//
// Owns the output layout, the active storage provider, the segment relay and
// the running transcoder invocation. Requests arrive on a bounded command
// queue and are applied one at a time by a single worker task.

use super::status::{Broadcaster, StatusBoard, StatusReader};
use super::ControllerPhase;
use crate::layout::OutputLayout;
use crate::relay::SegmentRelay;
use crate::storage::{build_provider, StorageProvider};
use crate::transcoder::{InputKind, TranscodeHandle, TranscodeJob, Transcoder};
use livecast_core::config::StorageConfig;
use livecast_core::metrics::lifecycle::{BROADCAST_LIVE, TRANSITIONS};
use livecast_core::{Config, Error, Result, SharedConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// The placeholder is always cut into 10 second segments
pub const OFFLINE_SEGMENT_SECONDS: u32 = 10;

const COMMAND_QUEUE_DEPTH: usize = 16;

/// An inbound broadcast reported by the ingest side
#[derive(Debug, Clone)]
pub struct LiveSource {
    /// Transcoder input for the live stream (URL or pipe path)
    pub input: String,
    pub broadcaster: Broadcaster,
}

/// Outcome of a start/stop notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Already in the requested state
    Ignored,
}

enum Command {
    StreamStarted {
        source: LiveSource,
        reply: oneshot::Sender<Result<Transition>>,
    },
    StreamStopped {
        reply: oneshot::Sender<Result<Transition>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle used by the ingest side and the process entry point.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<ControllerPhase>,
    status: StatusBoard,
}

impl ControllerHandle {
    /// Report that a broadcaster connected.
    pub async fn notify_stream_started(&self, source: LiveSource) -> Result<Transition> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StreamStarted { source, reply }).await?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Report that the broadcaster went away.
    pub async fn notify_stream_stopped(&self) -> Result<Transition> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StreamStopped { reply }).await?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Stop the transcoder, flush the relay and release the provider.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub fn record_viewer_count(&self, count: u64) {
        self.status.record_viewer_count(count);
    }

    #[must_use]
    pub fn status(&self) -> StatusReader {
        self.status.reader()
    }

    #[must_use]
    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| controller_gone())
    }
}

fn controller_gone() -> Error {
    Error::InvalidState("stream controller has shut down".to_string())
}

/// State owned by the controller worker.
pub struct StreamController {
    config: SharedConfig,
    transcoder: Arc<dyn Transcoder>,
    layout: OutputLayout,
    storage_config: Option<StorageConfig>,
    provider: Option<Arc<dyn StorageProvider>>,
    relay: Option<SegmentRelay>,
    active: Option<TranscodeHandle>,
    phase: ControllerPhase,
    phase_tx: watch::Sender<ControllerPhase>,
    status: StatusBoard,
}

impl StreamController {
    /// Bring the subsystem to `Offline` and spawn the controller worker.
    ///
    /// Any startup failure is returned after partially started pieces have
    /// been stopped again.
    pub async fn start(
        config: SharedConfig,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<(ControllerHandle, JoinHandle<()>)> {
        let snapshot = config.snapshot();
        let layout = OutputLayout::new(
            &snapshot.storage.public_hls_path,
            &snapshot.storage.private_hls_path,
            &snapshot.storage.thumbnail_path,
        );
        let (phase_tx, phase_rx) = watch::channel(ControllerPhase::Initializing);

        let mut controller = Self {
            config,
            transcoder,
            layout,
            storage_config: None,
            provider: None,
            relay: None,
            active: None,
            phase: ControllerPhase::Initializing,
            phase_tx,
            status: StatusBoard::default(),
        };

        if let Err(e) = controller.initialize(&snapshot).await {
            error!("Stream subsystem failed to start: {}", e);
            controller.teardown().await;
            return Err(e);
        }

        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = ControllerHandle {
            commands,
            phase: phase_rx,
            status: controller.status.clone(),
        };

        let span = tracing::info_span!("stream_controller");
        let worker = tokio::spawn(controller.run(rx).instrument(span));

        Ok((handle, worker))
    }

    async fn initialize(&mut self, config: &Config) -> Result<()> {
        self.layout.reset(config.video.quality_count()).await?;

        let provider = build_provider(&config.storage)?;
        provider.setup().await?;
        info!("Storage provider ready: {}", provider.kind().as_str());

        self.relay = Some(SegmentRelay::start(
            Arc::clone(&provider),
            self.layout.private_root(),
            &config.relay,
        ));
        self.provider = Some(provider);
        self.storage_config = Some(config.storage.clone());

        if self
            .layout
            .provision_default_thumbnail(&config.storage.logo_path)
            .await?
        {
            info!("Default thumbnail provisioned");
        }

        self.start_offline(config).await?;
        self.set_phase(ControllerPhase::Offline);
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::StreamStarted { source, reply } => {
                    let result = self.on_stream_started(source).await;
                    let _ = reply.send(result);
                }
                Command::StreamStopped { reply } => {
                    let result = self.on_stream_stopped().await;
                    let _ = reply.send(result);
                }
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        // Every handle dropped without an explicit shutdown
        if self.phase != ControllerPhase::ShuttingDown {
            self.shutdown().await;
        }
    }

    async fn on_stream_started(&mut self, source: LiveSource) -> Result<Transition> {
        match self.phase {
            ControllerPhase::Offline => {}
            ControllerPhase::Live => {
                info!("Stream already live, ignoring start from {}", source.broadcaster.remote_addr);
                return Ok(Transition::Ignored);
            }
            phase => {
                return Err(Error::InvalidState(format!(
                    "cannot go live while {}",
                    phase.as_str()
                )))
            }
        }

        let config = self.config.snapshot();
        self.stop_active().await;

        let started = match self.prepare_output(&config).await {
            Ok(()) => self.launch(&config, InputKind::Live, &source.input).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!("Failed to go live, staying offline: {}", e);
            if let Err(restart) = self.start_offline(&config).await {
                error!("Offline placeholder did not restart: {}", restart);
            }
            return Err(e);
        }

        info!("Stream live from {}", source.broadcaster.remote_addr);
        self.set_phase(ControllerPhase::Live);
        self.status.go_live(source.broadcaster);
        Ok(Transition::Applied)
    }

    async fn on_stream_stopped(&mut self) -> Result<Transition> {
        match self.phase {
            ControllerPhase::Live => {}
            ControllerPhase::Offline => return Ok(Transition::Ignored),
            phase => {
                return Err(Error::InvalidState(format!(
                    "cannot go offline while {}",
                    phase.as_str()
                )))
            }
        }

        let config = self.config.snapshot();
        self.stop_active().await;

        info!("Stream went offline");
        self.set_phase(ControllerPhase::Offline);
        self.status.go_offline();

        // A failed reconfiguration keeps the previous provider and relay;
        // the placeholder resumes on them either way
        let prepared = self.prepare_output(&config).await;
        if let Err(e) = &prepared {
            error!("Output not reconfigured, keeping current storage: {}", e);
        }
        if let Err(e) = self.start_offline(&config).await {
            error!("Offline placeholder did not restart: {}", e);
            return Err(e);
        }
        prepared.map(|()| Transition::Applied)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down stream subsystem");
        let was_live = self.phase == ControllerPhase::Live;
        self.teardown().await;
        self.set_phase(ControllerPhase::ShuttingDown);
        if was_live {
            self.status.go_offline();
        }
    }

    async fn teardown(&mut self) {
        self.stop_active().await;
        if let Some(relay) = self.relay.take() {
            relay.stop().await;
        }
        self.provider = None;
        self.storage_config = None;
    }

    /// Bring the layout and provider in line with `config`.
    ///
    /// Must run with no transcoder invocation active. The relay is stopped
    /// and flushed before the layout is wiped or the provider replaced, and
    /// restarted afterwards even when the reset failed.
    async fn prepare_output(&mut self, config: &Config) -> Result<()> {
        let quality_count = config.video.quality_count();
        let ladder_changed = self.layout.needs_reset(quality_count);
        let storage_changed = self.storage_config.as_ref() != Some(&config.storage);
        if !ladder_changed && !storage_changed {
            return Ok(());
        }

        // A replacement that fails setup leaves the running relay untouched
        let replacement = if storage_changed {
            let provider = build_provider(&config.storage)?;
            provider.setup().await?;
            Some(provider)
        } else {
            None
        };

        if let Some(relay) = self.relay.take() {
            relay.stop().await;
        }

        let reset = if ladder_changed {
            info!("Quality ladder changed, resetting output to {} rendition(s)", quality_count);
            self.layout.reset(quality_count).await
        } else {
            Ok(())
        };

        if let Some(provider) = replacement {
            info!("Storage provider replaced: {}", provider.kind().as_str());
            self.provider = Some(provider);
            self.storage_config = Some(config.storage.clone());
        }

        match &self.provider {
            Some(provider) => {
                self.relay = Some(SegmentRelay::start(
                    Arc::clone(provider),
                    self.layout.private_root(),
                    &config.relay,
                ));
            }
            None => warn!("No storage provider, segment relay not restarted"),
        }

        reset.map_err(Error::from)
    }

    async fn start_offline(&mut self, config: &Config) -> Result<()> {
        let input = config.video.offline_content_path.to_string_lossy().into_owned();
        self.launch(config, InputKind::OfflinePlaceholder, &input).await
    }

    async fn launch(&mut self, config: &Config, kind: InputKind, input: &str) -> Result<()> {
        let segment_length_seconds = match kind {
            InputKind::OfflinePlaceholder => OFFLINE_SEGMENT_SECONDS,
            InputKind::Live => config.video.segment_length_seconds,
        };
        let job = TranscodeJob {
            input: input.to_string(),
            kind,
            segment_length_seconds,
            playlist_length: config.video.playlist_length,
            output_dir: self.layout.private_root().to_path_buf(),
            qualities: config.video.effective_qualities(),
        };

        let handle = self.transcoder.start(job).await?;
        self.active = Some(handle);
        Ok(())
    }

    async fn stop_active(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.stop().await;
        }
    }

    fn set_phase(&mut self, phase: ControllerPhase) {
        if self.phase == phase {
            return;
        }
        TRANSITIONS
            .with_label_values(&[self.phase.as_str(), phase.as_str()])
            .inc();
        BROADCAST_LIVE.set(i64::from(phase == ControllerPhase::Live));
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

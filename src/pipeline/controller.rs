//! Pipeline wiring: one task per source, the multiplexer, the batch processor
//! and the health monitor, plus the operator control surface.

use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::batch::BatchMultiplexer;
use super::processor::BatchProcessor;
use super::ringbuf::MuxStats;
use crate::capture::source::health_cell;
use crate::capture::{
    DecoderFactory, DefaultDecoderFactory, FrameSource, HealthCell, SourceCommand, SourceHealth,
    SourceState,
};
use crate::config::Settings;
use crate::display::{AlertFanout, AlertSink, FrameSink, LogAlerts, NullSink, SnapshotWriter, Tiler};
use crate::health::{HealthMonitor, Monitored};
use crate::{Error, Result};

/// External collaborators the core hands data to
#[derive(Clone)]
pub struct Collaborators {
    pub decoders: Arc<dyn DecoderFactory>,
    pub sink: Arc<dyn FrameSink>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// URI-selected decoders, no renderer, JSON alert log plus snapshots when configured
    pub fn standard(settings: &Settings) -> Result<Self> {
        let configs = settings.stream_configs()?;
        let ids = configs.iter().map(|c| c.id.clone()).collect();
        let mut alerts: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlerts::new(ids))];

        if let Some(dir) = &settings.output.snapshot_dir {
            info!("Saving motion snapshots under {}", dir.display());
            let rois = configs.iter().map(|c| c.roi).collect();
            alerts.push(Arc::new(SnapshotWriter::new(dir.clone(), rois)));
        }

        Ok(Self {
            decoders: Arc::new(DefaultDecoderFactory),
            sink: Arc::new(NullSink),
            alerts: Arc::new(AlertFanout(alerts)),
        })
    }
}

/// Operator-facing view of one stream
struct StreamHandle {
    index: usize,
    id: String,
    health: HealthCell,
    /// None for streams left unstarted for lack of capacity
    commands: Option<Sender<SourceCommand>>,
}

/// Cloneable handle for the operator control surface
#[derive(Clone)]
pub struct ControlHandle {
    streams: Arc<Vec<StreamHandle>>,
    capacity: usize,
}

impl ControlHandle {
    /// Stream identifier or index → index
    pub fn resolve(&self, id: &str) -> Result<usize> {
        if let Some(s) = self.streams.iter().find(|s| s.id == id) {
            return Ok(s.index);
        }
        id.parse::<usize>()
            .ok()
            .filter(|i| *i < self.streams.len())
            .ok_or_else(|| Error::UnknownStream(id.to_string()))
    }

    pub fn id(&self, index: usize) -> Option<&str> {
        self.streams.get(index).map(|s| s.id.as_str())
    }

    fn send(&self, id: &str, command: SourceCommand) -> Result<usize> {
        let index = self.resolve(id)?;
        let stream = &self.streams[index];
        let Some(commands) = &stream.commands else {
            return Err(Error::ResourceExhaustion {
                requested: self.streams.len(),
                capacity: self.capacity,
            });
        };
        commands
            .send(command)
            .map_err(|_| Error::connection(index, "source task has stopped"))?;
        Ok(index)
    }

    /// Operator start: clears the failure count and any hold
    #[instrument(skip(self))]
    pub fn start_stream(&self, id: &str) -> Result<()> {
        let index = self.send(id, SourceCommand::Start { operator: true })?;
        info!(stream = index, "Operator start");
        Ok(())
    }

    /// Operator stop: the stream stays down until an operator start
    #[instrument(skip(self))]
    pub fn stop_stream(&self, id: &str) -> Result<()> {
        let index = self.send(id, SourceCommand::Stop { hold: true })?;
        info!(stream = index, "Operator stop");
        Ok(())
    }

    pub fn health(&self, id: &str) -> Result<SourceHealth> {
        let index = self.resolve(id)?;
        Ok((**self.streams[index].health.load()).clone())
    }

    pub fn health_all(&self) -> Vec<(String, SourceHealth)> {
        self.streams
            .iter()
            .map(|s| (s.id.clone(), (**s.health.load()).clone()))
            .collect()
    }
}

/// Running pipeline
pub struct Pipeline {
    control: ControlHandle,
    sources: Vec<(usize, JoinHandle<()>, Sender<SourceCommand>)>,
    multiplexer: JoinHandle<()>,
    processor: JoinHandle<()>,
    monitor: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    stats: Arc<MuxStats>,
}

impl Pipeline {
    /// Validate settings and start every stream that fits.
    ///
    /// Configuration errors abort before anything connects. Streams past
    /// `pipeline.max_streams` are reported and never started.
    #[instrument(skip_all)]
    pub async fn start(settings: &Settings, collaborators: Collaborators) -> Result<Self> {
        let configs = settings.stream_configs()?;
        let total = configs.len();
        let capacity = settings.pipeline.max_streams;

        if capacity == 0 {
            return Err(Error::ResourceExhaustion {
                requested: total,
                capacity,
            });
        }
        if total > capacity {
            let err = Error::ResourceExhaustion {
                requested: total,
                capacity,
            };
            error!("{}; streams {}..{} will not be started", err, capacity, total);
        }

        info!("Starting pipeline with {} streams", total.min(capacity));

        let queue = settings.source.queue_depth.max(1) * total;
        let (frame_tx, frame_rx) = flume::bounded(queue);
        let (batch_tx, batch_rx) = flume::bounded(settings.batch.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut monitor = HealthMonitor::new(
            Duration::from_millis(settings.health.interval_ms.max(1)),
            settings.health.auto_restart,
        );
        let mut handles = Vec::with_capacity(total);
        let mut sources = Vec::new();
        let rois: Vec<_> = configs.iter().map(|c| c.roi).collect();

        for config in configs {
            let health = health_cell();

            if config.index >= capacity {
                handles.push(StreamHandle {
                    index: config.index,
                    id: config.id,
                    health,
                    commands: None,
                });
                continue;
            }

            let (cmd_tx, cmd_rx) = flume::unbounded();
            let index = config.index;
            let id = config.id.clone();
            let source = FrameSource::new(
                Arc::new(config),
                Arc::clone(&collaborators.decoders),
                Arc::clone(&health),
            );

            let task = tokio::spawn(source.run(cmd_rx, frame_tx.clone()));
            cmd_tx
                .send(SourceCommand::Start { operator: false })
                .map_err(|_| Error::connection(index, "source task exited at startup"))?;

            monitor.register(Monitored {
                index,
                id: id.clone(),
                health: Arc::clone(&health),
                commands: cmd_tx.clone(),
            });
            handles.push(StreamHandle {
                index,
                id,
                health,
                commands: Some(cmd_tx.clone()),
            });
            sources.push((index, task, cmd_tx));
        }
        // Sources hold the only frame senders; the multiplexer ends once they all do
        drop(frame_tx);

        let mux = BatchMultiplexer::new(total, settings.batch.period(), settings.batch.max_pending_age());
        let stats = mux.stats();
        let multiplexer = tokio::spawn(mux.run(frame_rx, batch_tx));

        let processor = BatchProcessor::new(
            &rois,
            &settings.motion,
            Tiler::new(settings.tiler.width, settings.tiler.height),
            collaborators.sink,
            collaborators.alerts,
        );
        let processor = tokio::task::spawn_blocking(move || processor.run_blocking(batch_rx));

        let monitor = tokio::spawn(monitor.run(shutdown_rx));

        Ok(Self {
            control: ControlHandle {
                streams: Arc::new(handles),
                capacity,
            },
            sources,
            multiplexer,
            processor,
            monitor,
            shutdown: shutdown_tx,
            stats,
        })
    }

    pub fn handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    /// Stop everything and wait until every source is Disconnected
    #[instrument(skip_all)]
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down pipeline");
        let _ = self.shutdown.send(true);
        if let Err(e) = self.monitor.await {
            error!("Health monitor task failed: {}", e);
        }

        for (_, _, commands) in &self.sources {
            let _ = commands.send(SourceCommand::Shutdown);
        }
        for (index, task, _) in self.sources {
            if let Err(e) = task.await {
                error!(stream = index, "Source task failed: {}", e);
            }
        }

        if let Err(e) = self.multiplexer.await {
            error!("Multiplexer task failed: {}", e);
        }
        if let Err(e) = self.processor.await {
            error!("Batch processor failed: {}", e);
        }

        let lingering: Vec<_> = self
            .control
            .health_all()
            .into_iter()
            .filter(|(_, h)| h.state != SourceState::Disconnected)
            .map(|(id, _)| id)
            .collect();
        if !lingering.is_empty() {
            warn!("Sources not disconnected after shutdown: {:?}", lingering);
        }

        let stats = self.stats.snapshot();
        info!(
            "Pipeline stopped: {} batches, {} frames in, {} overwritten",
            stats.batches, stats.frames_in, stats.overwritten
        );
        Ok(())
    }
}

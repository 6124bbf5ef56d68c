//! Periodic liveness sweep over every source's health record

use std::collections::HashSet;
use std::time::{Duration, Instant};

use flume::Sender;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::capture::{HealthCell, SourceCommand, SourceHealth, SourceState};

/// One registered stream
pub struct Monitored {
    pub index: usize,
    pub id: String,
    pub health: HealthCell,
    pub commands: Sender<SourceCommand>,
}

/// Decision taken for one stream during a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    Restart(usize),
    GaveUp(usize),
}

/// Owns the health registry, keyed by stream index
pub struct HealthMonitor {
    streams: Vec<Monitored>,
    interval: Duration,
    auto_restart: bool,
    reported: HashSet<usize>,
}

impl HealthMonitor {
    pub fn new(interval: Duration, auto_restart: bool) -> Self {
        Self {
            streams: Vec::new(),
            interval,
            auto_restart,
            reported: HashSet::new(),
        }
    }

    pub fn register(&mut self, stream: Monitored) {
        self.streams.push(stream);
    }

    /// Snapshot of one stream's record
    pub fn health(&self, index: usize) -> Option<SourceHealth> {
        self.streams
            .iter()
            .find(|s| s.index == index)
            .map(|s| (**s.health.load()).clone())
    }

    /// Inspect every stream once and issue restarts where due
    pub fn sweep(&mut self, now: Instant) -> Vec<SweepAction> {
        let mut actions = Vec::new();

        for stream in &self.streams {
            let health = stream.health.load();
            if health.state != SourceState::Disconnected || health.operator_hold {
                continue;
            }

            if health.exhausted {
                // Once per give-up; an operator start clears `exhausted`
                if self.reported.insert(stream.index) {
                    error!(
                        stream = stream.index,
                        id = %stream.id,
                        "Gave up after {} consecutive failures; waiting for operator",
                        health.consecutive_failures
                    );
                    actions.push(SweepAction::GaveUp(stream.index));
                }
                continue;
            }
            self.reported.remove(&stream.index);

            if !self.auto_restart {
                continue;
            }
            if health.retry_at.is_some_and(|at| at > now) {
                continue;
            }

            info!(
                stream = stream.index,
                id = %stream.id,
                "Restarting (failures so far: {})",
                health.consecutive_failures
            );
            if stream
                .commands
                .send(SourceCommand::Start { operator: false })
                .is_ok()
            {
                actions.push(SweepAction::Restart(stream.index));
            }
        }

        actions
    }

    #[instrument(skip_all, name = "health_monitor")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick is immediate; sources were just started
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let actions = self.sweep(Instant::now());
                    if !actions.is_empty() {
                        debug!("Sweep: {:?}", actions);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    }
}

//! Settings: built-in defaults, a TOML/JSON settings file, then `ARGUS_*` environment overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::motion::{MotionParams, Roi};
use crate::{Error, Result};

/// Full pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub streams: Vec<StreamEntry>,
    pub source: SourceSettings,
    pub batch: BatchSettings,
    pub motion: MotionParams,
    pub tiler: TilerSettings,
    pub health: HealthSettings,
    pub pipeline: PipelineSettings,
    pub output: OutputSettings,
}

/// One stream as written in the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub uri: String,
    /// `[x, y, w, h]`; full frame when absent
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

impl StreamEntry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: None,
            uri: uri.into(),
            roi: None,
            fps: None,
            max_attempts: None,
            backoff_ms: None,
        }
    }

    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub default_fps: f64,
    /// Staleness timeout expressed in frame intervals
    pub stale_frames: u32,
    pub min_staleness_ms: u64,
    /// Consecutive staleness periods before a stalled source is torn down
    pub stall_restart_after: u32,
    pub connect_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Streaming time after which a clean end resets the failure count
    pub stable_after_ms: u64,
    /// Consecutive decode errors tolerated before a forced reconnect
    pub decode_error_threshold: u32,
    pub queue_depth: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            default_fps: 30.0,
            stale_frames: 15,
            min_staleness_ms: 200,
            stall_restart_after: 10,
            connect_timeout_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            stable_after_ms: 10_000,
            decode_error_threshold: 5,
            queue_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub period_ms: u64,
    /// Close the batch early once the oldest pending frame is this old
    pub max_pending_age_ms: Option<u64>,
    pub queue_depth: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            period_ms: 33,
            max_pending_age_ms: None,
            queue_depth: 4,
        }
    }
}

impl BatchSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    pub fn max_pending_age(&self) -> Option<Duration> {
        self.max_pending_age_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilerSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for TilerSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_ms: u64,
    pub auto_restart: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            auto_restart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Streams beyond this count are reported and left unstarted
    pub max_streams: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { max_streams: 64 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Motion snapshots land in `<dir>/stream_<i>/frame_<seq>.jpg`
    pub snapshot_dir: Option<PathBuf>,
}

/// Reconnect behaviour for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub stable_after: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_cap)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Immutable, validated per-stream descriptor
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub index: usize,
    pub id: String,
    pub uri: String,
    pub roi: Option<Roi>,
    pub fps: f64,
    pub reconnect: ReconnectPolicy,
    pub staleness: Duration,
    pub stall_restart_after: u32,
    pub connect_timeout: Duration,
    pub decode_error_threshold: u32,
    pub queue_depth: usize,
}

impl StreamConfig {
    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.fps).unwrap_or(Duration::MAX)
    }
}

/// `None` when the rate is not positive or its period does not fit a `Duration`
pub fn frame_interval(fps: f64) -> Option<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps).ok()
}

impl Settings {
    /// Load settings from a file, then apply `ARGUS_*` environment overrides.
    ///
    /// A bare JSON array is accepted as a plain stream list. Anything else,
    /// including TOML opening with a table header, goes through the layered loader.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading settings from {}", path.display());

        let text = std::fs::read_to_string(path)?;
        if let Ok(streams) = serde_json::from_str::<Vec<StreamEntry>>(&text) {
            debug!("Settings file is a bare stream list ({} entries)", streams.len());
            return Ok(Self {
                streams,
                ..Self::default()
            });
        }

        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => config::FileFormat::Json,
            _ => config::FileFormat::Toml,
        };

        let settings = config::Config::builder()
            .add_source(config::File::from_str(&text, format))
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        Ok(settings)
    }

    pub fn from_streams(streams: Vec<StreamEntry>) -> Self {
        Self {
            streams,
            ..Self::default()
        }
    }

    /// Resolve and validate the stream list. Any error here aborts startup.
    pub fn stream_configs(&self) -> Result<Vec<StreamConfig>> {
        if self.streams.is_empty() {
            return Err(Error::Configuration("no streams configured".into()));
        }

        let src = &self.source;
        let mut seen = HashSet::new();
        let mut configs = Vec::with_capacity(self.streams.len());

        for (index, entry) in self.streams.iter().enumerate() {
            let id = entry
                .id
                .clone()
                .unwrap_or_else(|| format!("stream-{}", index));
            if !seen.insert(id.clone()) {
                return Err(Error::Configuration(format!("duplicate stream id '{}'", id)));
            }
            if entry.uri.trim().is_empty() {
                return Err(Error::Configuration(format!("stream '{}' has an empty uri", id)));
            }
            if let Some(roi) = entry.roi {
                if roi.w == 0 || roi.h == 0 {
                    return Err(Error::Configuration(format!(
                        "stream '{}' has an empty region of interest {}",
                        id, roi
                    )));
                }
            }

            let fps = entry.fps.unwrap_or(src.default_fps);
            let Some(interval) = frame_interval(fps) else {
                return Err(Error::Configuration(format!(
                    "stream '{}' has an invalid frame rate {}",
                    id, fps
                )));
            };
            let staleness = interval
                .saturating_mul(src.stale_frames.max(1))
                .max(Duration::from_millis(src.min_staleness_ms));

            configs.push(StreamConfig {
                index,
                id,
                uri: entry.uri.clone(),
                roi: entry.roi,
                fps,
                reconnect: ReconnectPolicy {
                    max_attempts: entry.max_attempts.unwrap_or(src.max_attempts).max(1),
                    backoff_base: Duration::from_millis(
                        entry.backoff_ms.unwrap_or(src.backoff_base_ms),
                    ),
                    backoff_cap: Duration::from_millis(src.backoff_cap_ms),
                    stable_after: Duration::from_millis(src.stable_after_ms),
                },
                staleness,
                stall_restart_after: src.stall_restart_after.max(1),
                connect_timeout: Duration::from_millis(src.connect_timeout_ms),
                decode_error_threshold: src.decode_error_threshold.max(1),
                queue_depth: src.queue_depth.max(1),
            });
        }

        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bare_json_array_loads_as_stream_list() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"[{{"uri": "rtsp://cam1/stream", "roi": [10, 20, 300, 200]}},
                {{"uri": "rtsp://cam2/stream"}}]"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.streams.len(), 2);
        assert_eq!(settings.streams[0].roi, Some(Roi::new(10, 20, 300, 200)));
        assert_eq!(settings.streams[1].roi, None);
        assert_eq!(settings.batch.period_ms, 33);
    }

    #[test]
    fn toml_settings_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[batch]
period_ms = 100

[motion]
threshold = 40

[[streams]]
id = "gate"
uri = "synthetic://320x240"
roi = [0, 0, 100, 100]
max_attempts = 3
"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.batch.period_ms, 100);
        assert_eq!(settings.motion.threshold, 40);
        assert_eq!(settings.motion.min_area, 500);

        let configs = settings.stream_configs().unwrap();
        assert_eq!(configs[0].id, "gate");
        assert_eq!(configs[0].reconnect.max_attempts, 3);
    }

    #[test]
    fn toml_opening_with_stream_table_loads() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "[[streams]]\nuri = \"synthetic://64x48\"\n\n[batch]\nperiod_ms = 50\n"
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.streams.len(), 1);
        assert_eq!(settings.batch.period_ms, 50);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "[health]\ninterval_ms = 250\nauto_restart = true\n\n[[streams]]\nuri = \"synthetic://\"\n"
        )
        .unwrap();

        std::env::set_var("ARGUS_HEALTH__INTERVAL_MS", "75");
        let loaded = Settings::load(file.path());
        std::env::remove_var("ARGUS_HEALTH__INTERVAL_MS");

        let settings = loaded.unwrap();
        assert_eq!(settings.health.interval_ms, 75);
        assert!(settings.health.auto_restart);
    }

    #[test]
    fn frame_rate_with_unrepresentable_period_is_fatal() {
        let mut entry = StreamEntry::new("synthetic://64x64");
        entry.fps = Some(1e-30);
        assert!(matches!(
            Settings::from_streams(vec![entry]).stream_configs(),
            Err(Error::Configuration(_))
        ));
        assert_eq!(frame_interval(0.0), None);
        assert_eq!(frame_interval(f64::NAN), None);
        assert_eq!(frame_interval(4.0), Some(Duration::from_millis(250)));
    }

    #[test]
    fn empty_stream_list_is_fatal() {
        let err = Settings::default().stream_configs().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn zero_sized_roi_is_fatal() {
        let settings = Settings::from_streams(vec![
            StreamEntry::new("synthetic://64x64").with_roi(Roi::new(0, 0, 0, 10))
        ]);
        assert!(matches!(
            settings.stream_configs(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn malformed_roi_fails_to_parse() {
        let result: std::result::Result<Vec<StreamEntry>, _> =
            serde_json::from_str(r#"[{"uri": "a", "roi": [1, 2, 3]}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut a = StreamEntry::new("synthetic://64x64");
        a.id = Some("cam".into());
        let b = a.clone();
        let settings = Settings::from_streams(vec![a, b]);
        assert!(matches!(
            settings.stream_configs(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn staleness_follows_frame_rate() {
        let mut slow = StreamEntry::new("synthetic://64x64");
        slow.fps = Some(10.0);
        let mut fast = StreamEntry::new("synthetic://64x64");
        fast.fps = Some(1_000.0);
        let configs = Settings::from_streams(vec![slow, fast])
            .stream_configs()
            .unwrap();
        assert_eq!(configs[0].staleness, Duration::from_millis(1_500));
        // 15 frames at 1000 fps is below the floor
        assert_eq!(configs[1].staleness, Duration::from_millis(200));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(1_000),
            stable_after: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert!(!policy.exhausted(9));
        assert!(policy.exhausted(10));
    }
}

use crate::error::{BusError, BusResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_IDLE_UPDATE_FREQUENCY: f64 = 0.5;
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 1024;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1_048_576;
pub const DEFAULT_EVENT_QUEUE_CAP: usize = 256;
pub const DEFAULT_INITIAL_BUFFER_CAPACITY: usize = 1024;

pub const ENV_IDLE_UPDATE_FREQUENCY: &str = "BRIDGE_IDLE_UPDATE_FREQUENCY";
pub const ENV_MAX_PENDING_REPLIES: &str = "BRIDGE_MAX_PENDING_REPLIES";
pub const ENV_MAX_FRAME_LEN: &str = "BRIDGE_MAX_FRAME_LEN";
pub const ENV_EVENT_QUEUE_CAP: &str = "BRIDGE_EVENT_QUEUE_CAP";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Seconds between wakes while nothing is happening.
    pub idle_update_frequency: f64,
    pub max_pending_replies: usize,
    /// Largest single encoded message accepted in either direction.
    pub max_frame_len: usize,
    /// Capacity of the cross-thread event queue.
    pub event_queue_cap: usize,
    pub initial_buffer_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            idle_update_frequency: DEFAULT_IDLE_UPDATE_FREQUENCY,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_queue_cap: DEFAULT_EVENT_QUEUE_CAP,
            initial_buffer_capacity: DEFAULT_INITIAL_BUFFER_CAPACITY,
        }
    }
}

impl BusConfig {
    pub fn from_json_str(raw: &str) -> BusResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| BusError::Config(format!("invalid bus config: {err}")))?;
        config.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| BusError::Config(format!("failed to read {}: {err}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlays values from `lookup`. Unparsable or non-positive values keep
    /// whatever the config already had.
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.idle_update_frequency = lookup(ENV_IDLE_UPDATE_FREQUENCY)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(self.idle_update_frequency);
        self.max_pending_replies =
            parse_positive(&lookup, ENV_MAX_PENDING_REPLIES).unwrap_or(self.max_pending_replies);
        self.max_frame_len =
            parse_positive(&lookup, ENV_MAX_FRAME_LEN).unwrap_or(self.max_frame_len);
        self.event_queue_cap =
            parse_positive(&lookup, ENV_EVENT_QUEUE_CAP).unwrap_or(self.event_queue_cap);
        self
    }

    pub fn set_idle_update_frequency(&mut self, seconds: f64) -> &mut Self {
        if seconds.is_finite() && seconds > 0.0 {
            self.idle_update_frequency = seconds;
        }
        self
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.idle_update_frequency)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_IDLE_UPDATE_FREQUENCY))
    }

    pub fn validate(self) -> BusResult<Self> {
        if !(self.idle_update_frequency.is_finite() && self.idle_update_frequency > 0.0) {
            return Err(BusError::Config(format!(
                "idle_update_frequency must be positive, got {}",
                self.idle_update_frequency
            )));
        }
        if self.max_pending_replies == 0 {
            return Err(BusError::Config("max_pending_replies must be > 0".to_string()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(BusError::Config(format!(
                "max_frame_len out of range: {}",
                self.max_frame_len
            )));
        }
        if self.event_queue_cap == 0 {
            return Err(BusError::Config("event_queue_cap must be > 0".to_string()));
        }
        Ok(self)
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

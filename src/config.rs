use crate::error::Error;
use clap::ValueEnum;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub const DEFAULT_MAX_SPAWN_ATTEMPTS: usize = 3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum Recycle {
    /// Keep the worker for the next request.
    Reuse,
    /// Replace the worker after every evaluation.
    Respawn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub num_concurrent: usize,
    pub recycle: Recycle,
    pub max_spawn_attempts: usize,
    pub respawn_failed_workers: bool,
    pub kill_after: Option<Duration>,
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn from_yaml_str(yaml_str: &str) -> Result<Self, Error> {
        let raw: RawEngineConfig = serde_yaml::from_str(yaml_str)?;

        let mut builder = EngineConfigBuilder::new();
        if let Some(num_concurrent) = raw.num_concurrent {
            builder.num_concurrent(num_concurrent);
        }
        if let Some(recycle) = raw.recycle {
            builder.recycle(recycle);
        }
        if let Some(max_spawn_attempts) = raw.max_spawn_attempts {
            builder.max_spawn_attempts(max_spawn_attempts);
        }
        if let Some(respawn_failed_workers) = raw.respawn_failed_workers {
            builder.respawn_failed_workers(respawn_failed_workers);
        }
        if let Some(kill_after) = raw.kill_after {
            builder.kill_after(kill_after);
        }
        if let Some(poll_interval) = raw.poll_interval {
            builder.poll_interval(poll_interval);
        }

        builder.build()
    }
}

pub fn parse_duration_str(value: &str) -> Result<Duration, Error> {
    parse_duration::parse::parse(value).map_err(|err| Error::InvalidDuration {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|value| parse_duration_str(&value).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEngineConfig {
    num_concurrent: Option<usize>,
    recycle: Option<Recycle>,
    max_spawn_attempts: Option<usize>,
    respawn_failed_workers: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    kill_after: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    poll_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig {
                num_concurrent: 1,
                recycle: Recycle::Reuse,
                max_spawn_attempts: DEFAULT_MAX_SPAWN_ATTEMPTS,
                respawn_failed_workers: true,
                kill_after: None,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
        }
    }

    pub fn num_concurrent(&mut self, num_concurrent: usize) -> &mut Self {
        self.config.num_concurrent = num_concurrent;
        self
    }

    pub fn recycle(&mut self, recycle: Recycle) -> &mut Self {
        self.config.recycle = recycle;
        self
    }

    pub fn max_spawn_attempts(&mut self, max_spawn_attempts: usize) -> &mut Self {
        self.config.max_spawn_attempts = max_spawn_attempts;
        self
    }

    pub fn respawn_failed_workers(&mut self, respawn_failed_workers: bool) -> &mut Self {
        self.config.respawn_failed_workers = respawn_failed_workers;
        self
    }

    pub fn kill_after(&mut self, kill_after: Duration) -> &mut Self {
        self.config.kill_after = Some(kill_after);
        self
    }

    pub fn poll_interval(&mut self, poll_interval: Duration) -> &mut Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn build(&self) -> Result<EngineConfig, Error> {
        if self.config.num_concurrent == 0 {
            return Err(Error::ZeroNumConcurrent);
        }
        if self.config.max_spawn_attempts == 0 {
            return Err(Error::ZeroSpawnAttempts);
        }
        if self.config.poll_interval.is_zero() {
            return Err(Error::ZeroPollInterval);
        }
        Ok(self.config.clone())
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

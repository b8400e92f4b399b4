use crate::constants::{
    DEFAULT_AUTOSCALER_INTERVAL_SECONDS, DEFAULT_HEARTBEAT_SECONDS, DEFAULT_HUNG_SECONDS,
    DEFAULT_IDLE_GRACE_SECONDS, DEFAULT_LOCK_TTL_SECONDS,
};
use crate::error::CoordError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level configuration for a coordination process (coordinator, worker,
/// or `coordctl`). Loaded once at startup from the environment; nothing in
/// the core mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub kv: KvConfig,
    pub heartbeat: HeartbeatConfig,
    pub lock: LockConfig,
    pub autoscaler: AutoScalerConfig,
}

/// Where and how to reach the shared KV, and the fallback used when it
/// can't be reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// `REDIS_URL`. `None` means go straight to the file fallback.
    pub redis_url: Option<String>,
    /// `AGENTCOORD_FALLBACK_DIR`, default `~/.agentcoord/state`.
    pub fallback_dir: std::path::PathBuf,
}

/// `AGENTCOORD_HEARTBEAT_SECONDS` / `AGENTCOORD_HUNG_SECONDS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    pub hung_seconds: i64,
}

/// `AGENTCOORD_LOCK_TTL_SECONDS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    pub default_ttl_seconds: u64,
}

/// Auto-scaler policy. Not directly named by an env var;
/// these are the process-level defaults a coordinator boots with, and can
/// be overridden programmatically by whatever higher layer configures the
/// scaler for a given deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub tasks_per_worker: usize,
    pub interval_seconds: u64,
    pub idle_grace_seconds: i64,
    /// `max_tasks` passed to every worker this scaler spawns; `None` means
    /// a spawned worker runs indefinitely rather than self-terminating
    /// after a fixed number of claims.
    pub worker_max_tasks: Option<u32>,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            tasks_per_worker: 4,
            interval_seconds: DEFAULT_AUTOSCALER_INTERVAL_SECONDS,
            idle_grace_seconds: DEFAULT_IDLE_GRACE_SECONDS,
            worker_max_tasks: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
    .ok()
    .and_then(|v| v.parse::<T>().ok())
    .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment, following
    /// `dotenvy` + `std::env`. Nothing here is a hard requirement-with-panic:
    /// every value has a documented default, so a bare `agentcoord-core`
    /// boots with zero env vars set (against the file fallback).
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(?path, "loaded .env file"),
            Err(dotenvy::Error::Io(_)) => tracing::debug!("no .env file found, using process env"),
            Err(e) => tracing::warn!(error = %e, "failed to parse .env file"),
        }

        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty());

        let fallback_dir = env::var("AGENTCOORD_FALLBACK_DIR")
        .ok()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(default_fallback_dir);

        let heartbeat = HeartbeatConfig {
            interval_seconds: env_parse("AGENTCOORD_HEARTBEAT_SECONDS", DEFAULT_HEARTBEAT_SECONDS),
            hung_seconds: env_parse("AGENTCOORD_HUNG_SECONDS", DEFAULT_HUNG_SECONDS),
        };

        if heartbeat.interval_seconds == 0 {
            return Err(CoordError::Configuration(
                    "AGENTCOORD_HEARTBEAT_SECONDS must be greater than zero".into(),
            ));
        }
        if heartbeat.hung_seconds <= 0 {
            return Err(CoordError::Configuration(
                    "AGENTCOORD_HUNG_SECONDS must be greater than zero".into(),
            ));
        }

        let lock = LockConfig {
            default_ttl_seconds: env_parse("AGENTCOORD_LOCK_TTL_SECONDS", DEFAULT_LOCK_TTL_SECONDS),
        };
        if lock.default_ttl_seconds == 0 {
            return Err(CoordError::Configuration(
                    "AGENTCOORD_LOCK_TTL_SECONDS must be greater than zero".into(),
            ));
        }

        Ok(Config {
                kv: KvConfig {
                    redis_url,
                    fallback_dir,
                },
                heartbeat,
                lock,
                autoscaler: AutoScalerConfig::default(),
        })
    }
}

fn default_fallback_dir() -> std::path::PathBuf {
    dirs_home().join(".agentcoord").join("state")
}

/// Thin stand-in for a `dirs`-style home lookup so the crate doesn't take on
/// another dependency purely for one path join; falls back to `.` when
/// `HOME`/`USERPROFILE` aren't set (e.g. some CI sandboxes).
fn dirs_home() -> std::path::PathBuf {
    env::var("HOME")
    .or_else(|_| env::var("USERPROFILE"))
    .map(std::path::PathBuf::from)
    .unwrap_or_else(|_| std::path::PathBuf::from("."))
}

#[cfg(test)]
mod tests;

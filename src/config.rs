use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::queue::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_ENQUEUE_TIMEOUT};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Directories searched for [`CONFIG_FILE_NAME`], first hit wins.
pub const CONFIG_DIRS: [&str; 3] = [".", "./config", "/etc/event-aggregator"];

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_PREFIX: &str = "APP";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis: Option<RedisConfig>,
    pub queue: QueueConfig,
    /// Upper bound on draining the HTTP server and the consumer after a signal.
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl Config {
    /// Reads `APP_*` variables from the process environment (and `.env`, if
    /// present), falling back to `config.yaml` from the first of [`CONFIG_DIRS`]
    /// that has one.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let file = match find_config_file(&CONFIG_DIRS) {
            Some(path) => match load_file(&path) {
                Ok(values) => {
                    debug!(path = %path.display(), "Loaded config file");
                    values
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not read config file");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        Self::from_lookup(layered(|key| env::var(key).ok(), file))
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let redis = match get("APP_REDIS_ADDR") {
            Some(addr) => Some(RedisConfig {
                addr,
                password: get("APP_REDIS_PASSWORD"),
                db: parse_or(&get, "APP_REDIS_DB", 0)?,
            }),
            None => None,
        };

        let timeout_ms = parse_or(
            &get,
            "APP_QUEUE_TIMEOUT_MS",
            DEFAULT_ENQUEUE_TIMEOUT.as_millis() as u64,
        )?;
        let shutdown_ms = parse_or(
            &get,
            "APP_SERVER_SHUTDOWN_TIMEOUT_MS",
            DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
        )?;

        Ok(Self {
            port: parse_or(&get, "APP_SERVER_PORT", 8080)?,
            redis,
            queue: QueueConfig {
                capacity: parse_or(&get, "APP_QUEUE_CAPACITY", DEFAULT_CAPACITY)?,
                enqueue_timeout: Duration::from_millis(timeout_ms),
            },
            shutdown_timeout: Duration::from_millis(shutdown_ms),
        })
    }
}

/// Environment first; blank variables fall through to the file.
fn layered<E>(env: E, file: HashMap<String, String>) -> impl Fn(&str) -> Option<String>
where
    E: Fn(&str) -> Option<String>,
{
    move |key| {
        env(key)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| file.get(key).cloned())
    }
}

fn find_config_file(dirs: &[&str]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| Path::new(dir).join(CONFIG_FILE_NAME))
        .find(|path| path.is_file())
}

fn load_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_file(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Flattens nested YAML into the variable names the environment uses,
/// e.g. `server.port` becomes `APP_SERVER_PORT`.
fn parse_file(content: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    match serde_yaml::from_str::<Value>(content)? {
        Value::Null => {}
        root @ Value::Mapping(_) => flatten(ENV_PREFIX, &root, &mut values),
        _ => anyhow::bail!("expected a mapping at the top level"),
    }
    Ok(values)
}

fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let Some(key) = scalar(key) else { continue };
                flatten(&format!("{}_{}", prefix, key.to_uppercase()), child, out);
            }
        }
        other => {
            if let Some(v) = scalar(other) {
                out.insert(prefix.to_string(), v);
            }
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

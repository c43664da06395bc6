//! # Settings
//!
//! Configuration of the instrumentation engine. Settings are read from a YAML
//! file or string, and can be overridden from the environment.

use std::{env, fs::read_to_string, path::Path, time::Duration};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

const ENV_ENABLED: &str = "DD_INTERNAL_DYNAMIC_INSTRUMENTATION_ENABLED";
const ENV_REDACTED_IDENTIFIERS: &str = "DD_INTERNAL_DYNAMIC_INSTRUMENTATION_REDACTED_IDENTIFIERS";
const ENV_REDACTED_TYPES: &str = "DD_INTERNAL_DYNAMIC_INSTRUMENTATION_REDACTED_TYPES";
const ENV_SERVICE: &str = "DD_SERVICE";

/// Engine settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Is dynamic instrumentation enabled at all?
    pub enabled: bool,
    /// Allow line probes to use untargeted tracing when code tracking is not
    /// active. Untargeted tracing slows down every line of the process.
    pub untargeted_trace_points: bool,
    /// Re-raise errors and panics caught in the engine. Debug only.
    pub propagate_all_exceptions: bool,
    /// Identifiers redacted on top of the built-in list.
    pub redacted_identifiers: Vec<String>,
    /// Type names redacted from captures. A trailing `*` matches any type
    /// name starting with the given prefix.
    pub redacted_type_names: Vec<String>,
    pub max_capture_depth: i32,
    /// 0 means unlimited.
    pub max_capture_collection_size: usize,
    /// 0 means unlimited.
    pub max_capture_string_length: usize,
    /// 0 means unlimited.
    pub max_capture_attribute_count: usize,
    /// Service name reported in every payload.
    pub service: String,
    pub agent: AgentSettings,
    pub delivery: DeliverySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            untargeted_trace_points: false,
            propagate_all_exceptions: false,
            redacted_identifiers: Vec::new(),
            redacted_type_names: Vec::new(),
            max_capture_depth: 2,
            max_capture_collection_size: 100,
            max_capture_string_length: 255,
            max_capture_attribute_count: 20,
            service: default_service(),
            agent: AgentSettings::default(),
            delivery: DeliverySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let contents = read_to_string(path)?;
        Settings::from_str(contents.as_str())
    }

    /// Load settings from a YAML string. Missing keys take their default
    /// value.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Settings> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override settings from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = env::var(ENV_ENABLED) {
            self.enabled = parse_bool(ENV_ENABLED, &val)?;
        }
        if let Ok(val) = env::var(ENV_REDACTED_IDENTIFIERS) {
            self.redacted_identifiers = parse_list(&val);
        }
        if let Ok(val) = env::var(ENV_REDACTED_TYPES) {
            self.redacted_type_names = parse_list(&val);
        }
        if let Ok(val) = env::var(ENV_SERVICE) {
            if !val.trim().is_empty() {
                self.service = val.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.delivery.queue_capacity == 0 {
            bail!("delivery.queue_capacity must be greater than 0");
        }
        if self.agent.host.is_empty() {
            bail!("agent.host cannot be empty");
        }
        Ok(())
    }
}

/// Connection to the agent receiving the payloads.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub host: String,
    pub port: u16,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_seconds")]
    pub timeout: Duration,
    /// Use https.
    pub ssl: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8126,
            timeout: Duration::from_secs(30),
            ssl: false,
        }
    }
}

impl AgentSettings {
    pub fn base_url(&self) -> String {
        let scheme = match self.ssl {
            true => "https",
            false => "http",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Background delivery tuning.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliverySettings {
    /// Capacity of each of the status and snapshot queues.
    pub queue_capacity: usize,
    /// How long the worker sleeps when both queues are empty.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "idle_interval_ms")]
    pub idle_interval: Duration,
    /// How long to wait for the worker to finish when stopping it.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stop_timeout_ms")]
    pub stop_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            idle_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_millis(1000),
        }
    }
}

fn default_service() -> String {
    env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unnamed-service".to_string())
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    Ok(match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => bail!("Invalid boolean value for {key}: {val}"),
    })
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();

        assert!(!s.enabled);
        assert!(!s.untargeted_trace_points);
        assert!(!s.propagate_all_exceptions);
        assert_eq!(s.max_capture_depth, 2);
        assert_eq!(s.max_capture_collection_size, 100);
        assert_eq!(s.max_capture_string_length, 255);
        assert_eq!(s.max_capture_attribute_count, 20);
        assert_eq!(s.agent.base_url(), "http://localhost:8126");
        assert_eq!(s.agent.timeout, Duration::from_secs(30));
        assert_eq!(s.delivery.queue_capacity, 1024);
        assert!(!s.service.is_empty());
    }

    #[test]
    fn from_yaml() {
        let s = Settings::from_str(
            r#"
enabled: true
service: checkout
redacted_type_names: ["Secret*"]
max_capture_collection_size: 3
agent:
  host: agent.local
  port: 9000
  timeout_seconds: 5
  ssl: true
delivery:
  idle_interval_ms: 10
"#,
        )
        .unwrap();

        assert!(s.enabled);
        assert_eq!(s.service, "checkout");
        assert_eq!(s.redacted_type_names, vec!["Secret*"]);
        assert_eq!(s.max_capture_collection_size, 3);
        assert_eq!(s.max_capture_depth, 2);
        assert_eq!(s.agent.base_url(), "https://agent.local:9000");
        assert_eq!(s.agent.timeout, Duration::from_secs(5));
        assert_eq!(s.delivery.idle_interval, Duration::from_millis(10));
        assert_eq!(s.delivery.stop_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn invalid_yaml() {
        assert!(Settings::from_str("unknown_key: 1").is_err());
        assert!(Settings::from_str("delivery:\n  queue_capacity: 0").is_err());
        assert!(Settings::from_str("max_capture_depth: deep").is_err());
    }

    #[test]
    fn load_missing_file() {
        assert!(Settings::load("/nonexistent/probekit.yaml").is_err());
    }

    #[test]
    #[serial(env)]
    fn env_overrides() {
        env::set_var(ENV_ENABLED, "true");
        env::set_var(ENV_REDACTED_IDENTIFIERS, " foo , bar_baz,,");
        env::set_var(ENV_REDACTED_TYPES, "Secret*,Token");
        env::set_var(ENV_SERVICE, "billing");

        let mut s = Settings::default();
        let res = s.apply_env();

        env::remove_var(ENV_ENABLED);
        env::remove_var(ENV_REDACTED_IDENTIFIERS);
        env::remove_var(ENV_REDACTED_TYPES);
        env::remove_var(ENV_SERVICE);

        assert!(res.is_ok());
        assert!(s.enabled);
        assert_eq!(s.redacted_identifiers, vec!["foo", "bar_baz"]);
        assert_eq!(s.redacted_type_names, vec!["Secret*", "Token"]);
        assert_eq!(s.service, "billing");
    }

    #[test]
    #[serial(env)]
    fn env_invalid_bool() {
        env::set_var(ENV_ENABLED, "maybe");
        let res = Settings::default().apply_env();
        env::remove_var(ENV_ENABLED);

        assert!(res.is_err());
    }
}

//! TOML config file loading, environment overrides and validation.
//!
//! Every section is optional; a missing file yields the defaults. Env vars
//! win over the file so a container can be repointed without editing it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::coordinator::{validate_garden_id, Tuning};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hub: HubSection,
    pub mqtt: MqttSection,
    pub cloud: CloudSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub web_port: u16,
    pub poll_interval_sec: u64,
    pub request_timeout_ms: u64,
    pub upcoming_limit: usize,
    /// Gardens opened at startup.
    pub gardens: Vec<String>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            web_port: 8080,
            poll_interval_sec: 5,
            request_timeout_ms: 10_000,
            upcoming_limit: 5,
            gardens: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "garden-hub".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    pub base_url: String,
    pub api_token: Option<String>,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".into(),
            api_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:garden.db?mode=rwc".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Longest request timeout accepted; anything above means a typo in units.
const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_endpoints(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;

        if h.web_port == 0 {
            errors.push("hub: web_port must be non-zero".into());
        }
        if h.poll_interval_sec == 0 {
            errors.push("hub: poll_interval_sec must be positive, got 0".into());
        }
        if h.request_timeout_ms == 0 || h.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            errors.push(format!(
                "hub: request_timeout_ms {} out of range [1, {MAX_REQUEST_TIMEOUT_MS}]",
                h.request_timeout_ms
            ));
        }
        if h.upcoming_limit == 0 {
            errors.push("hub: upcoming_limit must be positive, got 0".into());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, g) in h.gardens.iter().enumerate() {
            if let Err(e) = validate_garden_id(g) {
                errors.push(format!("hub.gardens[{i}]: {e}"));
            } else if !seen.insert(g) {
                errors.push(format!("hub.gardens[{i}]: duplicate garden '{g}'"));
            }
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt: port must be non-zero".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }

        let url = self.cloud.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "cloud: base_url '{url}' must start with http:// or https://"
            ));
        }
        if matches!(&self.cloud.api_token, Some(t) if t.trim().is_empty()) {
            errors.push("cloud: api_token is set but empty".into());
        }

        if !self.database.url.starts_with("sqlite:") {
            errors.push(format!(
                "database: url '{}' is not a sqlite: url",
                self.database.url
            ));
        }
    }

    /// Apply env overrides from `lookup`, normally `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT '{v}' is not a port number"))?;
        }
        if let Some(v) = lookup("DB_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.hub.web_port = v
                .parse()
                .with_context(|| format!("WEB_PORT '{v}' is not a port number"))?;
        }
        if let Some(v) = lookup("CLOUD_URL") {
            self.cloud.base_url = v;
        }
        if let Some(v) = lookup("CLOUD_TOKEN") {
            self.cloud.api_token = Some(v);
        }
        Ok(())
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            poll_interval: Duration::from_secs(self.hub.poll_interval_sec),
            request_timeout: Duration::from_millis(self.hub.request_timeout_ms),
            upcoming_limit: self.hub.upcoming_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply env overrides, then validate.
/// A missing file is not an error.
pub fn load(path: &str) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config.apply_env(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        Config {
            hub: HubSection {
                gardens: vec!["backyard".into()],
                ..HubSection::default()
            },
            ..Config::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[hub]
web_port = 9000
poll_interval_sec = 15
request_timeout_ms = 2500
upcoming_limit = 3
gardens = ["backyard", "balcony"]

[mqtt]
host = "broker.local"
port = 8883

[cloud]
base_url = "https://garden.example.com/api"
api_token = "secret"

[database]
url = "sqlite:/var/lib/garden/hub.db"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hub.web_port, 9000);
        assert_eq!(config.hub.gardens, vec!["backyard", "balcony"]);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.client_id, "garden-hub");
        assert_eq!(config.cloud.api_token.as_deref(), Some("secret"));

        let t = config.tuning();
        assert_eq!(t.poll_interval, Duration::from_secs(15));
        assert_eq!(t.request_timeout, Duration::from_millis(2500));
        assert_eq!(t.upcoming_limit, 3);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.hub.poll_interval_sec, 5);
        assert_eq!(config.hub.request_timeout_ms, 10_000);
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.cloud.api_token.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[hub]\nweb_port = 81\n").unwrap();
        assert_eq!(config.hub.web_port, 81);
        assert_eq!(config.hub.upcoming_limit, 5);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = load("/nonexistent/garden-hub.toml").unwrap();
        assert_eq!(config.hub.web_port, HubSection::default().web_port);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut cfg = valid_config();
        cfg.hub.poll_interval_sec = 0;
        assert_validation_err(&cfg, "poll_interval_sec must be positive");
    }

    #[test]
    fn request_timeout_bounds() {
        let mut cfg = valid_config();
        cfg.hub.request_timeout_ms = 0;
        assert_validation_err(&cfg, "request_timeout_ms 0 out of range");
        cfg.hub.request_timeout_ms = MAX_REQUEST_TIMEOUT_MS + 1;
        assert_validation_err(&cfg, "out of range");
        cfg.hub.request_timeout_ms = MAX_REQUEST_TIMEOUT_MS;
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_upcoming_limit_rejected() {
        let mut cfg = valid_config();
        cfg.hub.upcoming_limit = 0;
        assert_validation_err(&cfg, "upcoming_limit must be positive");
    }

    #[test]
    fn garden_ids_must_be_topic_safe_and_unique() {
        let mut cfg = valid_config();
        cfg.hub.gardens = vec!["a/b".into()];
        assert_validation_err(&cfg, "reserved character");

        cfg.hub.gardens = vec!["backyard".into(), "backyard".into()];
        assert_validation_err(&cfg, "duplicate garden 'backyard'");
    }

    #[test]
    fn cloud_url_needs_http_scheme() {
        let mut cfg = valid_config();
        cfg.cloud.base_url = "garden.example.com".into();
        assert_validation_err(&cfg, "must start with http://");
    }

    #[test]
    fn blank_api_token_rejected() {
        let mut cfg = valid_config();
        cfg.cloud.api_token = Some("  ".into());
        assert_validation_err(&cfg, "api_token is set but empty");
    }

    #[test]
    fn non_sqlite_database_rejected() {
        let mut cfg = valid_config();
        cfg.database.url = "postgres://localhost/garden".into();
        assert_validation_err(&cfg, "is not a sqlite: url");
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut cfg = valid_config();
        cfg.hub.poll_interval_sec = 0;
        cfg.mqtt.host = "".into();
        cfg.mqtt.port = 0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("poll_interval_sec"));
        assert!(msg.contains("host is empty"));
        assert!(msg.contains("port must be non-zero"));
    }

    #[test]
    fn single_error_uses_singular() {
        let mut cfg = valid_config();
        cfg.mqtt.port = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("1 error)"), "got: {msg}");
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_win_over_file() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[
            ("MQTT_HOST", "mqtt.lan"),
            ("MQTT_PORT", "1884"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "8081"),
            ("CLOUD_URL", "https://cloud.lan/api"),
            ("CLOUD_TOKEN", "t0k"),
        ]))
        .unwrap();

        assert_eq!(cfg.mqtt.host, "mqtt.lan");
        assert_eq!(cfg.mqtt.port, 1884);
        assert_eq!(cfg.database.url, "sqlite::memory:");
        assert_eq!(cfg.hub.web_port, 8081);
        assert_eq!(cfg.cloud.base_url, "https://cloud.lan/api");
        assert_eq!(cfg.cloud.api_token.as_deref(), Some("t0k"));
        cfg.validate().unwrap();
    }

    #[test]
    fn unparsable_port_override_is_an_error() {
        let mut cfg = valid_config();
        let err = cfg.apply_env(env(&[("MQTT_PORT", "eighteen")])).unwrap_err();
        assert!(format!("{err:#}").contains("MQTT_PORT"));
    }

    #[test]
    fn absent_env_leaves_config_alone() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[])).unwrap();
        assert_eq!(cfg.mqtt.host, "127.0.0.1");
    }
}

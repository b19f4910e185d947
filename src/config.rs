//! Agent configuration: YAML file, then `ZEPSEC_*` environment overrides,
//! then validation. Validation failure is the only fatal startup error.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::options::ScanOptions;
use crate::types::ScheduledScan;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub nmap: NmapConfig,
    pub delivery: DeliveryConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    #[serde(rename = "scheduled_scans")]
    pub scans: Vec<ScheduledScanConfig>,
}

/// HTTP listener for incoming scan requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: String,
    /// Bearer token callers must present.
    pub secret: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".into(),
            secret: String::new(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl AgentConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

/// Management service that receives results.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub api_token: String,
    pub verify_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_token: String::new(),
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NmapConfig {
    pub binary_path: String,
    pub use_sudo: bool,
    pub temp_dir: PathBuf,
    /// Kill the scanner after this long. Unset means wait indefinitely.
    #[serde(deserialize_with = "opt_duration")]
    pub timeout: Option<Duration>,
}

impl Default for NmapConfig {
    fn default() -> Self {
        Self {
            binary_path: "nmap".into(),
            use_sudo: true,
            temp_dir: PathBuf::from("/tmp/zepsec-nmap"),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    #[serde(deserialize_with = "duration")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "duration")]
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Queried in order; the first valid address wins.
    pub ip_endpoints: Vec<String>,
    #[serde(deserialize_with = "duration")]
    pub cache_ttl: Duration,
    #[serde(deserialize_with = "duration")]
    pub lookup_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_endpoints: vec![
                "https://api.ipify.org".into(),
                "https://ifconfig.me/ip".into(),
                "https://icanhazip.com".into(),
                "https://checkip.amazonaws.com".into(),
            ],
            cache_ttl: Duration::from_secs(5 * 60),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledScanConfig {
    pub name: String,
    pub targets: String,
    #[serde(default)]
    pub options: String,
    #[serde(deserialize_with = "duration")]
    pub interval: Duration,
}

impl From<&ScheduledScanConfig> for ScheduledScan {
    fn from(c: &ScheduledScanConfig) -> Self {
        ScheduledScan {
            name: c.name.clone(),
            targets: c.targets.clone(),
            options: c.options.clone(),
            interval: c.interval,
        }
    }
}

impl Config {
    /// Load `path` (a missing file means defaults), apply process environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(path: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        cfg.apply_env_overrides(env);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Non-empty `ZEPSEC_*` values replace file values.
    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.is_empty());
        let get_bool = |key: &str| get(key).and_then(|v| parse_bool(&v));

        if let Some(v) = get("ZEPSEC_LISTEN_ADDR") {
            self.agent.listen_addr = v;
        }
        if let Some(v) = get("ZEPSEC_AGENT_SECRET") {
            self.agent.secret = v;
        }
        if let Some(v) = get("ZEPSEC_TLS_CERT") {
            self.agent.tls_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ZEPSEC_TLS_KEY") {
            self.agent.tls_key = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ZEPSEC_SERVER_URL") {
            self.server.url = v;
        }
        if let Some(v) = get("ZEPSEC_API_TOKEN") {
            self.server.api_token = v;
        }
        if let Some(v) = get_bool("ZEPSEC_VERIFY_TLS") {
            self.server.verify_tls = v;
        }
        if let Some(v) = get("ZEPSEC_NMAP_PATH") {
            self.nmap.binary_path = v;
        }
        if let Some(v) = get_bool("ZEPSEC_NMAP_SUDO") {
            self.nmap.use_sudo = v;
        }
        if let Some(v) = get("ZEPSEC_NMAP_TEMP_DIR") {
            self.nmap.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ZEPSEC_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("ZEPSEC_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.secret.is_empty() {
            return Err(ConfigError::invalid(
                "agent.secret",
                "required (set agent.secret or ZEPSEC_AGENT_SECRET)",
            ));
        }
        if self.server.url.is_empty() {
            return Err(ConfigError::invalid(
                "server.url",
                "required (set server.url or ZEPSEC_SERVER_URL)",
            ));
        }
        if self.server.api_token.is_empty() {
            return Err(ConfigError::invalid(
                "server.api_token",
                "required (set server.api_token or ZEPSEC_API_TOKEN)",
            ));
        }
        self.listen_addr()?;
        if self.agent.tls_cert.is_some() != self.agent.tls_key.is_some() {
            return Err(ConfigError::invalid(
                "agent.tls_cert",
                "tls_cert and tls_key must be set together",
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("expected 'pretty' or 'json', got '{}'", self.logging.format),
            ));
        }
        if self.nmap.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("nmap.timeout", "must be greater than zero"));
        }

        let mut names = HashSet::new();
        for (i, scan) in self.scans.iter().enumerate() {
            let field = |f: &str| format!("scheduled_scans[{i}].{f}");
            if scan.name.is_empty()
                || !scan
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ConfigError::invalid(
                    field("name"),
                    "must be non-empty and use only letters, digits, '-', '_' or '.'",
                ));
            }
            if !names.insert(scan.name.as_str()) {
                return Err(ConfigError::invalid(
                    field("name"),
                    format!("duplicate name '{}'", scan.name),
                ));
            }
            if scan.targets.trim().is_empty() {
                return Err(ConfigError::invalid(field("targets"), "required"));
            }
            if scan.interval.is_zero() {
                return Err(ConfigError::invalid(
                    field("interval"),
                    "must be greater than zero",
                ));
            }
            let line = ScheduledScan::from(scan).command_line();
            if let Err(e) = ScanOptions::parse(&line) {
                return Err(ConfigError::invalid(field("options"), e.to_string()));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.agent.listen_addr.parse().map_err(|e| {
            ConfigError::invalid(
                "agent.listen_addr",
                format!("'{}': {e}", self.agent.listen_addr),
            )
        })
    }

    pub fn scheduled_scans(&self) -> Vec<ScheduledScan> {
        self.scans.iter().map(ScheduledScan::from).collect()
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom)
}

fn opt_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(d)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => humantime::parse_duration(s.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
agent:
  listen_addr: "127.0.0.1:9000"
  secret: "s3cret"
server:
  url: "https://zepsec.example.com/"
  api_token: "tok"
  verify_tls: false
nmap:
  binary_path: /usr/bin/nmap
  use_sudo: false
  timeout: 2h
delivery:
  max_retries: 5
  backoff_base: 500ms
scheduled_scans:
  - name: dmz
    targets: 10.0.0.0/24
    options: "-sV -T4"
    interval: 90m
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_full_document() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen_addr().unwrap().port(), 9000);
        assert!(!cfg.server.verify_tls);
        assert_eq!(cfg.nmap.timeout, Some(Duration::from_secs(7200)));
        assert_eq!(cfg.delivery.max_retries, 5);
        assert_eq!(cfg.delivery.backoff_base, Duration::from_millis(500));
        assert_eq!(cfg.delivery.request_timeout, Duration::from_secs(60));
        let scans = cfg.scheduled_scans();
        assert_eq!(scans[0].interval, Duration::from_secs(5400));
        assert_eq!(scans[0].command_line(), "10.0.0.0/24 -sV -T4");
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let cfg = Config::from_yaml("agent:\n  secret: x\n").unwrap();
        assert_eq!(cfg.agent.listen_addr, "0.0.0.0:8000");
        assert!(cfg.nmap.use_sudo);
        assert_eq!(cfg.nmap.binary_path, "nmap");
        assert_eq!(cfg.network.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.network.ip_endpoints.len(), 4);
        assert!(cfg.scans.is_empty());
    }

    #[test]
    fn env_overrides_win_and_bad_bools_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("ZEPSEC_AGENT_SECRET", "from-env"),
            ("ZEPSEC_NMAP_SUDO", "false"),
            ("ZEPSEC_VERIFY_TLS", "maybe"),
            ("ZEPSEC_SERVER_URL", ""),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.nmap.use_sudo = true;
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.agent.secret, "from-env");
        assert!(!cfg.nmap.use_sudo);
        assert!(!cfg.server.verify_tls);
        assert_eq!(cfg.server.url, "https://zepsec.example.com/");
    }

    #[test]
    fn missing_required_fields_fail_validation() {
        let cfg = Config::from_yaml("server:\n  url: http://x\n  api_token: t\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.secret"), "{err}");
    }

    #[test]
    fn missing_file_uses_defaults_plus_env() {
        let env: HashMap<&str, &str> = [
            ("ZEPSEC_AGENT_SECRET", "s"),
            ("ZEPSEC_SERVER_URL", "http://mgmt"),
            ("ZEPSEC_API_TOKEN", "t"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::load_with_env(Path::new("/nonexistent/zepsec.yml"), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();
        assert_eq!(cfg.server.url, "http://mgmt");
        assert!(Config::load_with_env(Path::new("/nonexistent/zepsec.yml"), no_env).is_err());
    }

    #[test]
    fn rejects_bad_scheduled_scans() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.scans.push(cfg.scans[0].clone());
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));

        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.scans[0].options = "-oN /etc/passwd".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.scans[0].interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unparsable_interval() {
        let text = SAMPLE.replace("90m", "every hour");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn tls_requires_both_paths() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.agent.tls_cert = Some("cert.pem".into());
        assert!(cfg.validate().is_err());
        cfg.agent.tls_key = Some("key.pem".into());
        cfg.validate().unwrap();
        assert!(cfg.agent.tls_enabled());
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = Config::from_yaml(include_str!("../config.example.yml")).unwrap();
        cfg.validate().unwrap();
        assert!(!cfg.agent.tls_enabled());
        let scans = cfg.scheduled_scans();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[1].interval, Duration::from_secs(30 * 60));
    }
}

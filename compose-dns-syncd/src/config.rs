use std::path::{Path, PathBuf};
use std::str::FromStr;
use serde::Deserialize;
use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Extract hosts from `traefik.http.routers.<router>.rule` labels
    #[serde(default)]
    pub process_traefik: bool,
    /// Host IP for services that carry DNS names but no `pihole.hostip`
    #[serde(default)]
    pub default_host_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub watch_mode: bool,
    #[serde(default)]
    pub timed_mode: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Quiet period after the last file event before the watcher fires
    #[serde(default = "default_watch_debounce")]
    pub watch_debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// What happens to entities that disappear from the label source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep their state and their lines in the output document
    #[default]
    Retain,
    /// Forget them and remove their lines
    Purge,
}

impl FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "purge" => Ok(Self::Purge),
            other => Err(anyhow!("unknown retention policy '{}', expected retain or purge", other)),
        }
    }
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_output_file() -> PathBuf {
    PathBuf::from("custom.list")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_watch_debounce() -> u64 {
    500
}

fn default_log_level() -> String {
    "compose_dns_syncd=info".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            process_traefik: false,
            default_host_ip: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            output_file: default_output_file(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            watch_mode: false,
            timed_mode: false,
            poll_interval_secs: default_poll_interval(),
            watch_debounce_ms: default_watch_debounce(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override fields from environment-style variables resolved by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("COMPOSE_FILE") {
            self.source.compose_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("PROCESS_TRAEFIK") {
            self.source.process_traefik = parse_bool("PROCESS_TRAEFIK", &value)?;
        }
        if let Some(value) = lookup("DEFAULT_HOST_IP") {
            let value = value.trim();
            self.source.default_host_ip = (!value.is_empty()).then(|| value.to_string());
        }
        if let Some(value) = lookup("STATE_FILE") {
            self.output.state_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("OUTPUT_FILE") {
            self.output.output_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("RETENTION") {
            self.output.retention = value.parse()?;
        }
        if let Some(value) = lookup("WATCH_MODE") {
            self.triggers.watch_mode = parse_bool("WATCH_MODE", &value)?;
        }
        if let Some(value) = lookup("TIMED_MODE") {
            self.triggers.timed_mode = parse_bool("TIMED_MODE", &value)?;
        }
        if let Some(value) = lookup("POLL_INTERVAL") {
            self.triggers.poll_interval_secs = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("POLL_INTERVAL must be a number of seconds, got '{}'", value))?;
        }
        if let Some(value) = lookup("WATCH_DEBOUNCE_MS") {
            self.triggers.watch_debounce_ms = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("WATCH_DEBOUNCE_MS must be a number, got '{}'", value))?;
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.log.level = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.triggers.poll_interval_secs == 0 {
            bail!("POLL_INTERVAL must be greater than zero");
        }
        if self.triggers.watch_debounce_ms == 0 {
            bail!("WATCH_DEBOUNCE_MS must be greater than zero");
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}

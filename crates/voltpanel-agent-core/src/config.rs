use anyhow::Context;
use backon::ExponentialBuilder;
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SupervisorError;

/// Default per-subscriber delivery queue length of the event hub
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Default cap on the bytes returned by a tail-only log read (64 KiB)
pub const DEFAULT_LOG_TAIL_BYTES: u64 = 64 * 1024;

const DATA_DIR_NAME: &str = ".alresia-voltpanel";
const REGISTRY_FILE: &str = "apps.json";
const PANEL_CONFIG_FILE: &str = "config.json";

/// Definition of a supervised process, as supplied by the caller
///
/// The definition is immutable once the process is started and is reused verbatim
/// on restart. `env` is overlaid on the supervisor's own environment.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub id: String,
    #[builder(default)]
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[serde(rename = "cwd", default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProcessDefinition {
    pub fn builder() -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::default()
    }

    /// Working directory to spawn in; an empty path means "inherit"
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_directory
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Reject definitions that must not reach the OS
    ///
    /// The id doubles as the log file stem, so it has to be a plain file name.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.id.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("id required".to_string()));
        }
        if !is_safe_file_stem(&self.id) {
            return Err(SupervisorError::InvalidRequest(format!(
                "id {:?} is not a valid file name",
                self.id
            )));
        }
        if self.command.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest(
                "command required".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProcessDefinitionBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

fn is_safe_file_stem(id: &str) -> bool {
    id != "."
        && id != ".."
        && !id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
}

/// Backoff used by restart while the previous run is still being reaped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartConfig {
    /// Minimum delay between start attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between start attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum number of retries after the first start attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether to randomize the delays
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: false,
        }
    }
}

impl RestartConfig {
    /// Fail fast: a restart whose previous run is still alive errors immediately
    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!(
                "min_delay_ms cannot be greater than max_delay_ms"
            ));
        }

        if self.max_attempts > 100 {
            return Err(anyhow::anyhow!("max_attempts should not exceed 100"));
        }

        if self.max_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("max_delay_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay())
            .with_max_delay(self.max_delay())
            .with_max_times(self.max_attempts as usize);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

fn default_min_delay_ms() -> u64 {
    25
}
fn default_max_delay_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    20
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SupervisorConfig {
    /// Root of the durable state (registry file and per-process logs)
    pub data_dir: PathBuf,
    #[builder(default = "DEFAULT_SUBSCRIBER_QUEUE_CAPACITY")]
    pub subscriber_queue_capacity: usize,
    /// Size of a tail-only log read, at most 64 KiB
    #[builder(default = "DEFAULT_LOG_TAIL_BYTES")]
    pub log_tail_bytes: u64,
    #[builder(default)]
    pub restart: RestartConfig,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Configuration rooted at `~/.alresia-voltpanel`
    pub fn with_default_data_dir() -> Result<Self, SupervisorError> {
        let root = DataDir::default_root().ok_or_else(|| {
            SupervisorError::Configuration("cannot determine home directory".to_string())
        })?;
        Self::builder()
            .data_dir(root)
            .build()
            .map_err(|e| SupervisorError::Configuration(e.to_string()))
    }
}

impl SupervisorConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.subscriber_queue_capacity == Some(0) {
            return Err("subscriber_queue_capacity must be at least 1".to_string());
        }
        if let Some(tail) = self.log_tail_bytes {
            if tail == 0 || tail > DEFAULT_LOG_TAIL_BYTES {
                return Err(format!(
                    "log_tail_bytes must be between 1 and {DEFAULT_LOG_TAIL_BYTES}"
                ));
            }
        }
        if let Some(restart) = &self.restart {
            restart.validate().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// On-disk layout of the panel's state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DATA_DIR_NAME))
    }

    /// Create the directory tree if needed
    pub fn ensure(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = Self { root: root.into() };
        std::fs::create_dir_all(dir.logs_dir())?;
        std::fs::create_dir_all(dir.runtime_dir())?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn panel_config_path(&self) -> PathBuf {
        self.root.join(PANEL_CONFIG_FILE)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }
}

/// Access token and listen port shared with the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelConfig {
    pub token: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

impl PanelConfig {
    pub const DEFAULT_PORT: u16 = 7788;

    pub fn generate() -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            port: Self::DEFAULT_PORT,
            created_at: Utc::now(),
        }
    }

    /// Read `config.json`, creating it with a fresh token on first use
    pub fn load_or_init(data_dir: &DataDir) -> anyhow::Result<Self> {
        let path = data_dir.panel_config_path();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::generate();
                config.save(data_dir)?;
                tracing::info!(path = %path.display(), "Initialized panel config");
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Write `config.json`; the file holds a secret so it is private to the user
    pub fn save(&self, data_dir: &DataDir) -> anyhow::Result<()> {
        let path = data_dir.panel_config_path();
        let bytes = serde_json::to_vec_pretty(self)?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

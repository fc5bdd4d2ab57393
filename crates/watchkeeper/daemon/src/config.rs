//! Configuration for watchkeeperd

use serde::{Deserialize, Serialize};
use std::time::Duration;
use watchkeeper_kernel::KernelConfig;

/// Default bound on `AwaitingValidation`; the daemon takes no decisions itself.
pub const DEFAULT_VALIDATION_WAIT_MS: u64 = 15 * 60 * 1000;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Decision kernel configuration
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Audit memory configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Snapshot source
    #[serde(default)]
    pub source: SourceConfig,

    /// Analysis provider endpoint
    #[serde(default)]
    pub analysis: EndpointConfig,

    /// Optional narrative provider endpoint
    #[serde(default)]
    pub narrative: EndpointConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let mut kernel = KernelConfig::default();
        kernel.orchestrator.validation_wait_ms = Some(DEFAULT_VALIDATION_WAIT_MS);
        Self {
            kernel,
            storage: StorageConfig::default(),
            source: SourceConfig::default(),
            analysis: EndpointConfig::default(),
            narrative: EndpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Audit memory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL, e.g. `sqlite://watchkeeper.db`. Unset keeps the audit
    /// trail in memory for the lifetime of the process.
    pub database_url: Option<String>,
}

/// Where snapshots come from. `url` wins over `file` when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON endpoint polled with GET
    pub url: Option<String>,

    /// JSON file re-read on every poll
    pub file: Option<String>,

    /// Bearer token sent with HTTP polls
    pub bearer_token: Option<String>,
}

/// An HTTP collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint URL; unset disables the collaborator
    pub url: Option<String>,

    /// Bearer token
    pub bearer_token: Option<String>,

    /// Client-side request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            bearer_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `WATCHKEEPER__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Environment overrides, e.g. WATCHKEEPER__KERNEL__POLICY__BALANCE_DELTA_THRESHOLD
        builder = builder.add_source(
            config::Environment::with_prefix("WATCHKEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

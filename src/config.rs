use crate::model::{IsolationLevel, TransactionOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub scheduling: SchedulingPolicy,
    pub transaction: TransactionConfig,
    pub error_format: ErrorFormat,
    pub retry: RetryConfig,
    pub catalog_path: Option<String>,
}

/// When observed requests are handed to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    /// Collect every request observed in the current turn, then flush them together
    #[default]
    Batched,
    /// Flush each request as soon as it is observed
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorFormat {
    #[default]
    Pretty,
    /// No call-site capture
    Minimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub max_wait_ms: u64,
    pub timeout_ms: u64,
    pub isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-issue a physical call once when the engine classifies the failure as transient
    pub transient: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingPolicy::default(),
            transaction: TransactionConfig::default(),
            error_format: ErrorFormat::default(),
            retry: RetryConfig::default(),
            catalog_path: None,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 2000,
            timeout_ms: 5000,
            isolation_level: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { transient: true }
    }
}

impl TransactionConfig {
    /// Fill unset options from the configured defaults
    pub fn resolve(&self, options: &TransactionOptions) -> TransactionOptions {
        TransactionOptions {
            max_wait_ms: Some(options.max_wait_ms.unwrap_or(self.max_wait_ms)),
            timeout_ms: Some(options.timeout_ms.unwrap_or(self.timeout_ms)),
            isolation_level: options.isolation_level.or(self.isolation_level),
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, an optional config file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&ClientConfig::default())?);

        config = config.add_source(config::File::with_name("oat-client").required(false));

        // OAT_CLIENT__TRANSACTION__TIMEOUT_MS=10000
        config = config.add_source(
            config::Environment::with_prefix("OAT_CLIENT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = config.build()?;
        let client_config: ClientConfig = config.try_deserialize()?;

        Ok(client_config)
    }

    pub fn captures_call_sites(&self) -> bool {
        self.error_format == ErrorFormat::Pretty
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingPolicy) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_retry(mut self, transient: bool) -> Self {
        self.retry.transient = transient;
        self
    }

    pub fn with_error_format(mut self, error_format: ErrorFormat) -> Self {
        self.error_format = error_format;
        self
    }

    pub fn with_transaction_defaults(mut self, max_wait_ms: u64, timeout_ms: u64) -> Self {
        self.transaction.max_wait_ms = max_wait_ms;
        self.transaction.timeout_ms = timeout_ms;
        self
    }
}

//! Function configuration resolved from the environment snapshot.
//!
//! Configuration is layered with figment:
//! 1. Default values (compiled in)
//! 2. Lambda environment variables taken from the [`EnvironmentSnapshot`]
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `AWS_LAMBDA_FUNCTION_TIMEOUT` | `function_timeout` | 300 s |
//! | `AWS_LAMBDA_FUNCTION_VERSION` | `function_version` | `$LATEST` |
//! | `AWS_LAMBDA_FUNCTION_MEMORY_SIZE` | `memory_size` | `3008` |
//! | `AWS_LAMBDA_FUNCTION_NAME` | `function_name` | `test_function` |
//! | `AWS_LAMBDA_FUNCTION_HANDLER`, then `_HANDLER` | `handler` | none |
//! | `AWS_ACCESS_KEY_ID` etc. | `credentials` | none |
//!
//! A variable set to the empty string counts as unset.

use crate::environment::EnvironmentSnapshot;
use crate::error::ConfigError;
use figment::{Figment, providers::Serialized};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the function timeout in whole seconds.
pub const TIMEOUT_VAR: &str = "AWS_LAMBDA_FUNCTION_TIMEOUT";

/// Largest accepted timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = u32::MAX as u64;

pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 300;
const ARN_PREFIX: &str = "arn:aws:lambda:us-east-1:012345678912:function:";

/// Resolved function configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Invoke timeout, also the clamp ceiling for reported durations.
    #[serde(with = "duration_secs")]
    pub function_timeout: Duration,
    /// Function version reported on START lines.
    pub function_version: String,
    /// Memory size in MB, reported verbatim.
    pub memory_size: String,
    /// Function name used in the invoked ARN.
    pub function_name: String,
    /// Handler reference passed to the runtime.
    pub handler: Option<String>,
    /// Credentials forwarded to the runtime.
    pub credentials: Credentials,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            function_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            function_version: "$LATEST".to_string(),
            memory_size: "3008".to_string(),
            function_name: "test_function".to_string(),
            handler: None,
            credentials: Credentials::default(),
        }
    }
}

impl EmulatorConfig {
    /// Resolves the configuration from an environment snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTimeout`] when the timeout variable is not
    /// a non-negative integer, [`ConfigError::TimeoutOutOfRange`] when it is
    /// above [`MAX_TIMEOUT_SECS`], or [`ConfigError::Figment`] if extraction
    /// fails.
    pub fn load(snapshot: &EnvironmentSnapshot) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(EmulatorConfig::default()))
            .merge(lambda_env(snapshot)?);

        Ok(figment.extract()?)
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// The invoked function ARN for this function.
    pub fn invoked_function_arn(&self) -> String {
        format!("{ARN_PREFIX}{}", self.function_name)
    }

    /// Timeout in whole seconds, as printed in the timeout message.
    pub fn timeout_secs(&self) -> u64 {
        self.function_timeout.as_secs()
    }

    /// Timeout in milliseconds, as handed to the sandbox.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.function_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// AWS credentials forwarded to the sandbox.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// `AWS_ACCESS_KEY_ID`.
    pub access_key_id: Option<String>,
    /// `AWS_SECRET_ACCESS_KEY`.
    pub secret_access_key: Option<String>,
    /// `AWS_SESSION_TOKEN`.
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .finish()
    }
}

/// Builder for [`EmulatorConfig`].
#[derive(Debug, Default)]
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: EmulatorConfig,
}

impl ConfigBuilder {
    /// Creates a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the function timeout.
    pub fn function_timeout(mut self, timeout: Duration) -> Self {
        self.config.function_timeout = timeout;
        self
    }

    /// Sets the function version.
    pub fn function_version(mut self, version: impl Into<String>) -> Self {
        self.config.function_version = version.into();
        self
    }

    /// Sets the memory size.
    pub fn memory_size(mut self, memory: impl Into<String>) -> Self {
        self.config.memory_size = memory.into();
        self
    }

    /// Sets the function name.
    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function_name = name.into();
        self
    }

    /// Sets the handler.
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.config.handler = Some(handler.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> EmulatorConfig {
        self.config
    }
}

/// Partial credentials for env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_token: Option<String>,
}

/// Partial config for Lambda env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    function_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<String>,
    credentials: PartialCredentials,
}

fn lambda_env(snapshot: &EnvironmentSnapshot) -> Result<Serialized<PartialConfig>, ConfigError> {
    let owned = |key: &str| snapshot.non_empty(key).map(str::to_string);

    let function_timeout = snapshot
        .non_empty(TIMEOUT_VAR)
        .map(parse_timeout)
        .transpose()?;

    let config = PartialConfig {
        function_timeout,
        function_version: owned("AWS_LAMBDA_FUNCTION_VERSION"),
        memory_size: owned("AWS_LAMBDA_FUNCTION_MEMORY_SIZE"),
        function_name: owned("AWS_LAMBDA_FUNCTION_NAME"),
        handler: owned("AWS_LAMBDA_FUNCTION_HANDLER").or_else(|| owned("_HANDLER")),
        credentials: PartialCredentials {
            access_key_id: owned("AWS_ACCESS_KEY_ID"),
            secret_access_key: owned("AWS_SECRET_ACCESS_KEY"),
            session_token: owned("AWS_SESSION_TOKEN"),
        },
    };

    Ok(Serialized::defaults(config))
}

fn parse_timeout(raw: &str) -> Result<u64, ConfigError> {
    let secs = raw
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidTimeout {
            value: raw.to_string(),
            source,
        })?;

    if secs > MAX_TIMEOUT_SECS {
        return Err(ConfigError::TimeoutOutOfRange {
            value: secs,
            max: MAX_TIMEOUT_SECS,
        });
    }
    Ok(secs)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmulatorConfig::load(&EnvironmentSnapshot::default()).unwrap();

        assert_eq!(config.function_timeout, Duration::from_secs(300));
        assert_eq!(config.timeout_ms(), 300_000);
        assert_eq!(config.function_version, "$LATEST");
        assert_eq!(config.memory_size, "3008");
        assert_eq!(config.function_name, "test_function");
        assert!(config.handler.is_none());
        assert_eq!(config.credentials, Credentials::default());
    }

    #[test]
    fn test_env_overrides_defaults() {
        let snapshot = EnvironmentSnapshot::from_entries([
            "AWS_LAMBDA_FUNCTION_TIMEOUT=5",
            "AWS_LAMBDA_FUNCTION_VERSION=3",
            "AWS_LAMBDA_FUNCTION_MEMORY_SIZE=128",
            "AWS_LAMBDA_FUNCTION_NAME=orders",
            "AWS_ACCESS_KEY_ID=AKIDEXAMPLE",
            "AWS_SECRET_ACCESS_KEY=secret",
        ]);

        let config = EmulatorConfig::load(&snapshot).unwrap();

        assert_eq!(config.function_timeout, Duration::from_secs(5));
        assert_eq!(config.function_version, "3");
        assert_eq!(config.memory_size, "128");
        assert_eq!(config.function_name, "orders");
        assert_eq!(
            config.credentials.access_key_id.as_deref(),
            Some("AKIDEXAMPLE")
        );
        assert_eq!(config.credentials.secret_access_key.as_deref(), Some("secret"));
        assert!(config.credentials.session_token.is_none());
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let snapshot = EnvironmentSnapshot::from_entries([
            "AWS_LAMBDA_FUNCTION_TIMEOUT=",
            "AWS_LAMBDA_FUNCTION_NAME=",
        ]);

        let config = EmulatorConfig::load(&snapshot).unwrap();

        assert_eq!(config.function_timeout, Duration::from_secs(300));
        assert_eq!(config.function_name, "test_function");
    }

    #[test]
    fn test_malformed_timeout_is_an_error() {
        for raw in ["abc", "1.5", "-3", "10s"] {
            let snapshot =
                EnvironmentSnapshot::from_entries([format!("AWS_LAMBDA_FUNCTION_TIMEOUT={raw}")]);

            match EmulatorConfig::load(&snapshot) {
                Err(ConfigError::InvalidTimeout { value, .. }) => assert_eq!(value, raw),
                other => panic!("expected InvalidTimeout for {raw:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let snapshot =
            EnvironmentSnapshot::from_entries(["AWS_LAMBDA_FUNCTION_TIMEOUT=10000000000000"]);

        match EmulatorConfig::load(&snapshot) {
            Err(ConfigError::TimeoutOutOfRange { value, max }) => {
                assert_eq!(value, 10_000_000_000_000);
                assert_eq!(max, MAX_TIMEOUT_SECS);
            }
            other => panic!("expected TimeoutOutOfRange, got {other:?}"),
        }

        let snapshot = EnvironmentSnapshot::from_entries([format!(
            "AWS_LAMBDA_FUNCTION_TIMEOUT={MAX_TIMEOUT_SECS}"
        )]);
        let config = EmulatorConfig::load(&snapshot).unwrap();
        assert_eq!(config.timeout_ms(), MAX_TIMEOUT_SECS * 1000);
    }

    #[test]
    fn test_timeout_ms_saturates() {
        let config = EmulatorConfig::builder()
            .function_timeout(Duration::MAX)
            .build();
        assert_eq!(config.timeout_ms(), u64::MAX);
    }

    #[test]
    fn test_handler_falls_back_to_underscore_handler() {
        let snapshot = EnvironmentSnapshot::from_entries(["_HANDLER=index.handler"]);
        let config = EmulatorConfig::load(&snapshot).unwrap();
        assert_eq!(config.handler.as_deref(), Some("index.handler"));

        let snapshot = EnvironmentSnapshot::from_entries([
            "_HANDLER=index.handler",
            "AWS_LAMBDA_FUNCTION_HANDLER=app.main",
        ]);
        let config = EmulatorConfig::load(&snapshot).unwrap();
        assert_eq!(config.handler.as_deref(), Some("app.main"));
    }

    #[test]
    fn test_invoked_function_arn() {
        let config = EmulatorConfig::builder().function_name("orders").build();
        assert_eq!(
            config.invoked_function_arn(),
            "arn:aws:lambda:us-east-1:012345678912:function:orders"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let credentials = Credentials {
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("very-secret".to_string()),
            session_token: Some("token".to_string()),
        };

        let debug = format!("{credentials:?}");
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("token\""));
    }
}

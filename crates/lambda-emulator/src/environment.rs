//! Snapshot of the environment handed to the sandbox at initialisation.
//!
//! The snapshot is taken once at startup and then treated as an immutable
//! value. It seeds the variables older pre-Runtime-API runtimes refuse to
//! start without, then overlays everything visible in the emulator's own
//! process environment.

use std::collections::BTreeMap;

/// Variables the platform always defines, overridden by the process environment.
pub const PLATFORM_DEFAULTS: [(&str, &str); 5] = [
    ("AWS_LAMBDA_LOG_GROUP_NAME", "/aws/lambda/Functions"),
    ("AWS_LAMBDA_LOG_STREAM_NAME", "$LATEST"),
    ("AWS_LAMBDA_FUNCTION_VERSION", "$LATEST"),
    ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "3008"),
    ("AWS_LAMBDA_FUNCTION_NAME", "test_function"),
];

/// Immutable mapping of environment variable names to values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Captures the current process environment on top of [`PLATFORM_DEFAULTS`].
    ///
    /// Names or values that are not valid UTF-8 are converted lossily.
    pub fn capture() -> Self {
        Self::with_overlay(std::env::vars_os().map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        }))
    }

    /// Builds a snapshot from raw `KEY=VALUE` entries.
    ///
    /// Each entry is split on its first `=` only, so values may contain `=`.
    /// An entry without any `=` defines the variable with an empty value.
    ///
    /// # Examples
    ///
    /// ```
    /// use lambda_emulator::EnvironmentSnapshot;
    ///
    /// let snapshot = EnvironmentSnapshot::from_entries(["TOKEN=a=b=c"]);
    /// assert_eq!(snapshot.get("TOKEN"), Some("a=b=c"));
    /// assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_VERSION"), Some("$LATEST"));
    /// ```
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_overlay(entries.into_iter().map(|entry| {
            let entry = entry.as_ref();
            match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry.to_string(), String::new()),
            }
        }))
    }

    /// Seeds the defaults and overlays `vars`; later pairs win.
    pub fn with_overlay<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map: BTreeMap<String, String> = PLATFORM_DEFAULTS
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        map.extend(vars);
        Self { vars: map }
    }

    /// Looks up a variable, including empty values.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Looks up a variable, treating an empty value as unset.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.is_empty())
    }

    /// Number of variables in the snapshot.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot holds no variables. Never true once defaults are seeded.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy with extra variables layered on top.
    #[must_use]
    pub fn overlaid<I, K, V>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.vars
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }

    /// Returns the underlying mapping.
    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.vars
    }
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self::with_overlay(std::iter::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_present_without_overlay() {
        let snapshot = EnvironmentSnapshot::default();

        assert_eq!(snapshot.len(), PLATFORM_DEFAULTS.len());
        assert_eq!(
            snapshot.get("AWS_LAMBDA_LOG_GROUP_NAME"),
            Some("/aws/lambda/Functions")
        );
        assert_eq!(snapshot.get("AWS_LAMBDA_LOG_STREAM_NAME"), Some("$LATEST"));
        assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE"), Some("3008"));
        assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_NAME"), Some("test_function"));
    }

    #[test]
    fn test_overlay_wins_over_defaults() {
        let snapshot = EnvironmentSnapshot::from_entries([
            "AWS_LAMBDA_FUNCTION_NAME=orders",
            "AWS_LAMBDA_FUNCTION_MEMORY_SIZE=512",
        ]);

        assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_NAME"), Some("orders"));
        assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE"), Some("512"));
        assert_eq!(snapshot.len(), PLATFORM_DEFAULTS.len());
    }

    #[test]
    fn test_split_on_first_equals_only() {
        let snapshot =
            EnvironmentSnapshot::from_entries(["DSN=postgres://u:p@h/db?sslmode=require", "EMPTY="]);

        assert_eq!(
            snapshot.get("DSN"),
            Some("postgres://u:p@h/db?sslmode=require")
        );
        assert_eq!(snapshot.get("EMPTY"), Some(""));
        assert_eq!(snapshot.non_empty("EMPTY"), None);
    }

    #[test]
    fn test_overlaid_does_not_mutate_original() {
        let base = EnvironmentSnapshot::default();
        let extended = base.overlaid([("AWS_LAMBDA_RUNTIME_API", "127.0.0.1:9001")]);

        assert_eq!(base.get("AWS_LAMBDA_RUNTIME_API"), None);
        assert_eq!(extended.get("AWS_LAMBDA_RUNTIME_API"), Some("127.0.0.1:9001"));
    }

    #[test]
    #[serial]
    fn test_capture_reads_process_environment() {
        temp_env::with_vars(
            [
                ("LAMBDA_EMULATOR_TEST_VAR", Some("x=y")),
                ("AWS_LAMBDA_FUNCTION_VERSION", Some("7")),
            ],
            || {
                let snapshot = EnvironmentSnapshot::capture();
                assert_eq!(snapshot.get("LAMBDA_EMULATOR_TEST_VAR"), Some("x=y"));
                assert_eq!(snapshot.get("AWS_LAMBDA_FUNCTION_VERSION"), Some("7"));
            },
        );
    }
}

//! Launch options and their translation into agent arguments

use crate::config::ReadinessConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Primary credential, emitted first after the artifact
pub const API_KEY: &str = "apiKey";
/// Secondary credential, emitted right after the key
pub const API_SECRET: &str = "apiSecret";
/// Raises agent output to `info` level logging
pub const VERBOSE: &str = "verbose";
/// Selects a specific artifact version
pub const TUNNEL_VERSION: &str = "tunnelVersion";

const RESERVED_KEYS: &[&str] = &[API_KEY, API_SECRET, VERBOSE, TUNNEL_VERSION];

/// Option names whose agent flag differs from the option name
const FLAG_NAMES: &[(&str, &str)] = &[
    ("tunnelIdentifier", "tunnel-identifier"),
    ("noBump", "nobump"),
    ("noCache", "nocache"),
];

/// Options for one launch.
///
/// Reserved keys (`apiKey`, `apiSecret`, `verbose`, `tunnelVersion`) are consumed by
/// the supervisor; every other key is forwarded to the agent as a flag, in the
/// order it was inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchConfig {
    options: Map<String, Value>,
}

impl LaunchConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both credentials
    pub fn with_credentials(self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.with(API_KEY, key.into()).with(API_SECRET, secret.into())
    }

    /// Select an artifact version
    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.with(TUNNEL_VERSION, version.into())
    }

    /// Set an arbitrary option
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set an arbitrary option in place
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.options.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.non_empty_str(API_KEY)
    }

    pub fn api_secret(&self) -> Option<&str> {
        self.non_empty_str(API_SECRET)
    }

    /// Whether agent output should be surfaced at `info` level
    pub fn verbose(&self) -> bool {
        self.options.get(VERBOSE).is_some_and(is_truthy)
    }

    /// Requested artifact version, if any
    pub fn tunnel_version(&self) -> Option<String> {
        match self.options.get(TUNNEL_VERSION)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Options forwarded to the agent, in insertion order
    pub fn forwarded(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.options
            .iter()
            .filter(|(name, _)| !RESERVED_KEYS.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value))
    }

    fn non_empty_str(&self, name: &str) -> Option<&str> {
        self.options
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for LaunchConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = LaunchConfig::new();
        for (name, value) in iter {
            config.set(name, value);
        }
        config
    }
}

/// Agent flag name for an option
pub fn flag_name(option: &str) -> &str {
    FLAG_NAMES
        .iter()
        .find(|(from, _)| *from == option)
        .map(|(_, to)| *to)
        .unwrap_or(option)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build the agent's argument vector.
///
/// Layout: artifact path, credentials (key then secret, when present), forwarded
/// options, then the readiness flag and marker path. A non-empty string option
/// becomes `--name value`; any other truthy option becomes a bare `--name`;
/// falsy options are left out.
pub fn build_arguments(
    config: &LaunchConfig,
    artifact: &Path,
    readiness: &ReadinessConfig,
) -> Vec<String> {
    let mut args = vec![artifact.display().to_string()];

    args.extend(config.api_key().map(str::to_string));
    args.extend(config.api_secret().map(str::to_string));

    for (name, value) in config.forwarded() {
        match value {
            Value::String(s) if !s.is_empty() => {
                args.push(format!("--{}", flag_name(name)));
                args.push(s.clone());
            }
            other if is_truthy(other) => args.push(format!("--{}", flag_name(name))),
            _ => {}
        }
    }

    args.push(readiness.flag.clone());
    args.push(readiness.marker_path.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn readiness() -> ReadinessConfig {
        ReadinessConfig {
            marker_path: PathBuf::from("/tmp/tunnel.ready"),
            ..Default::default()
        }
    }

    fn build(config: &LaunchConfig) -> Vec<String> {
        build_arguments(config, Path::new("/cache/tunnel.jar"), &readiness())
    }

    #[test]
    fn credentials_follow_the_artifact_in_order() {
        let args = build(&LaunchConfig::new().with_credentials("key", "secret"));
        assert_eq!(
            args,
            vec!["/cache/tunnel.jar", "key", "secret", "-f", "/tmp/tunnel.ready"]
        );
    }

    #[test]
    fn secret_without_key_is_still_positional() {
        let args = build(&LaunchConfig::new().with(API_SECRET, "secret"));
        assert_eq!(args[..2], ["/cache/tunnel.jar", "secret"]);
    }

    #[test]
    fn string_options_carry_their_value() {
        let args = build(
            &LaunchConfig::new()
                .with_credentials("fake", "fake")
                .with("tunnelIdentifier", "my-tunnel"),
        );
        let pos = args.iter().position(|a| a == "--tunnel-identifier").unwrap();
        assert_eq!(args[pos + 1], "my-tunnel");
    }

    #[test]
    fn booleans_toggle_bare_flags() {
        let on = build(&LaunchConfig::new().with("debug", true).with("noBump", true));
        assert!(on.contains(&"--debug".to_string()));
        assert!(on.contains(&"--nobump".to_string()));

        let off = build(
            &LaunchConfig::new()
                .with("debug", Value::Null)
                .with("noCache", false),
        );
        assert!(!off.contains(&"--debug".to_string()));
        assert!(!off.contains(&"--nocache".to_string()));
        assert_eq!(off.len(), 3);
    }

    #[test]
    fn falsy_values_are_omitted() {
        let args = build(
            &LaunchConfig::new()
                .with("logfile", "")
                .with("retries", 0)
                .with("pac", json!(null)),
        );
        assert_eq!(args, vec!["/cache/tunnel.jar", "-f", "/tmp/tunnel.ready"]);
    }

    #[test]
    fn nonzero_numbers_become_bare_flags() {
        let args = build(&LaunchConfig::new().with("sePort", 4445));
        assert_eq!(
            args,
            vec!["/cache/tunnel.jar", "--sePort", "-f", "/tmp/tunnel.ready"]
        );
    }

    #[test]
    fn reserved_keys_never_become_flags() {
        let args = build(
            &LaunchConfig::new()
                .with_credentials("k", "s")
                .with(VERBOSE, true)
                .with_version("2.7"),
        );
        assert!(!args.iter().any(|a| a == "--verbose" || a == "--tunnelVersion"));
        assert!(!args.iter().any(|a| a == "--apiKey" || a == "--apiSecret"));
    }

    #[test]
    fn flags_follow_insertion_order() {
        let config: LaunchConfig = serde_json::from_value(json!({
            "zeta": "1",
            "alpha": true,
            "apiKey": "k",
            "mid": "x"
        }))
        .unwrap();
        let args = build(&config);
        assert_eq!(
            args,
            vec![
                "/cache/tunnel.jar",
                "k",
                "--zeta",
                "1",
                "--alpha",
                "--mid",
                "x",
                "-f",
                "/tmp/tunnel.ready"
            ]
        );
    }

    #[test]
    fn readiness_pair_is_always_last() {
        let configs = [
            LaunchConfig::new(),
            LaunchConfig::new().with_credentials("k", "s"),
            LaunchConfig::new().with("noCache", true).with("x", "y"),
        ];
        for config in &configs {
            let args = build(config);
            assert_eq!(args[0], "/cache/tunnel.jar");
            assert_eq!(args[args.len() - 2..], ["-f", "/tmp/tunnel.ready"]);
        }
    }

    #[test]
    fn version_selector_accepts_numbers() {
        assert_eq!(
            LaunchConfig::new().with(TUNNEL_VERSION, 3).tunnel_version(),
            Some("3".to_string())
        );
        assert_eq!(LaunchConfig::new().with_version(" ").tunnel_version(), None);
        assert!(LaunchConfig::new().with(VERBOSE, 1).verbose());
    }
}

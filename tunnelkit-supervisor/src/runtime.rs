//! Runtime discovery and version checks

use crate::config::RuntimeConfig;
use crate::error::{Result, SupervisorError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

// `java version "1.8.0_301"`, `openjdk version "21" 2023-09-19`, `openjdk 17.0.9 2023-10-17`
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:version\s+"?|openjdk\s+)(\d+)"#).expect("version pattern is valid")
});

/// What the runtime probe found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Major version, when it could be read
    pub version: Option<u32>,
    /// Non-fatal problem worth surfacing to the user
    pub warning: Option<String>,
}

/// Extract the leading version number from a runtime self-report.
///
/// Only the first numeric component is read, so the legacy `1.8.x` scheme yields 1.
pub fn parse_version(output: &str) -> Option<u32> {
    VERSION_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Check a runtime self-report against the configured minimum.
///
/// An unreadable version is not fatal: it is reported through
/// [`RuntimeInfo::warning`] and launching may proceed.
pub fn validate_runtime(output: &str, runtime: &RuntimeConfig) -> Result<RuntimeInfo> {
    match parse_version(output) {
        Some(found) if found < runtime.min_version => Err(SupervisorError::RuntimeTooOld {
            runtime: runtime.name.clone(),
            found,
            required: runtime.min_version,
        }),
        Some(found) => Ok(RuntimeInfo {
            version: Some(found),
            warning: None,
        }),
        None => {
            let first_line = output.lines().next().unwrap_or_default().trim();
            let unknown = SupervisorError::RuntimeVersionUnknown {
                runtime: runtime.name.clone(),
                output: first_line.to_string(),
            };
            Ok(RuntimeInfo {
                version: None,
                warning: Some(unknown.to_string()),
            })
        }
    }
}

/// Invoke the runtime's version command and validate the answer.
///
/// # Errors
///
/// [`SupervisorError::RuntimeMissing`] if the program cannot be started or does not
/// answer in time, [`SupervisorError::RuntimeTooOld`] if it is below the minimum.
pub async fn check_runtime(runtime: &RuntimeConfig) -> Result<RuntimeInfo> {
    let missing = |reason: String| SupervisorError::RuntimeMissing {
        runtime: runtime.name.clone(),
        reason,
    };

    let probe = Command::new(&runtime.program)
        .args(&runtime.version_args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(runtime.probe_timeout, probe)
        .await
        .map_err(|_| missing(format!("no answer within {:?}", runtime.probe_timeout)))?
        .map_err(|e| missing(e.to_string()))?;

    // The JVM reports its version on stderr, other runtimes use stdout.
    let mut report = String::from_utf8_lossy(&output.stderr).into_owned();
    report.push_str(&String::from_utf8_lossy(&output.stdout));
    debug!(program = %runtime.program, status = ?output.status, "Runtime probe finished");

    let info = validate_runtime(&report, runtime)?;
    if let Some(ref warning) = info.warning {
        warn!("{}", warning);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn java() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn parses_legacy_and_modern_reports() {
        let legacy =
            "java version \"1.8.0_301\"\nJava(TM) SE Runtime Environment (build 1.8.0_301-b09)";
        assert_eq!(parse_version(legacy), Some(1));
        assert_eq!(
            parse_version("openjdk version \"11.0.12\" 2021-07-20\nOpenJDK Runtime Environment"),
            Some(11)
        );
        assert_eq!(
            parse_version("openjdk version \"17.0.1\" 2021-10-19\nOpenJDK Runtime Environment"),
            Some(17)
        );
        assert_eq!(
            parse_version("openjdk version \"21\" 2023-09-19\nOpenJDK Runtime Environment"),
            Some(21)
        );
        assert_eq!(parse_version("openjdk 17.0.9 2023-10-17"), Some(17));
    }

    #[test]
    fn unrelated_text_is_unparseable() {
        assert_eq!(parse_version("some random output"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn rejects_versions_below_minimum() {
        let err = validate_runtime("java version \"1.8.0_301\"", &java()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Java 1 is installed"), "{msg}");
        assert!(msg.contains("Java 11 or higher is required"), "{msg}");

        let err = validate_runtime("openjdk version \"10.0.2\"", &java()).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::RuntimeTooOld {
                found: 10,
                required: 11,
                ..
            }
        ));
    }

    #[test]
    fn accepts_minimum_and_newer() {
        for (report, expected) in [
            ("openjdk version \"11.0.12\" 2021-07-20", 11),
            ("openjdk version \"17.0.1\" 2021-10-19", 17),
            ("openjdk version \"21\" 2023-09-19", 21),
        ] {
            let info = validate_runtime(report, &java()).unwrap();
            assert_eq!(info.version, Some(expected));
            assert_eq!(info.warning, None);
        }
    }

    #[test]
    fn unknown_version_is_only_a_warning() {
        let info = validate_runtime("not a java version", &java()).unwrap();
        assert_eq!(info.version, None);
        assert!(info
            .warning
            .unwrap()
            .contains("Could not determine Java version"));
    }

    #[tokio::test]
    async fn missing_program_is_fatal() {
        let runtime = RuntimeConfig {
            program: "tunnelkit-no-such-runtime".to_string(),
            ..java()
        };
        let err = check_runtime(&runtime).await.unwrap_err();
        assert!(matches!(err, SupervisorError::RuntimeMissing { .. }));
        assert!(err.to_string().starts_with("Java might not be installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_reads_stderr_report() {
        let runtime = RuntimeConfig {
            program: "/bin/sh".to_string(),
            version_args: vec![
                "-c".to_string(),
                "echo 'openjdk version \"17.0.1\" 2021-10-19' >&2".to_string(),
            ],
            ..java()
        };
        let info = check_runtime(&runtime).await.unwrap();
        assert_eq!(info.version, Some(17));
    }
}

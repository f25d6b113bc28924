use std::path::Path;

use regex::RegexBuilder;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::rules::PolicyConfig;

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse policy file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Load and validate a policy file. All-or-nothing: any failure leaves the
/// caller without a config rather than with a partial one.
///
/// An empty `block_patterns` list is a load-time error. Letting it through
/// would hand the injection detector an empty list, trip its fail-close
/// state, and silently block all traffic at runtime; the operator finds out
/// here instead.
pub fn load(path: &Path) -> Result<PolicyConfig, PolicyLoadError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: PolicyConfig = serde_yaml::from_str(&content)?;

    if config.sql_rules.block_patterns.is_empty() {
        return Err(PolicyLoadError::Invalid(
            "sql_rules.block_patterns must have at least one pattern".to_string(),
        ));
    }

    // Invalid patterns are only skipped by the engine; warn here so the
    // coverage gap is visible at load time.
    for pattern in &config.sql_rules.block_patterns {
        if let Err(e) = RegexBuilder::new(pattern).case_insensitive(true).build() {
            warn!(
                pattern,
                error = %e,
                "block_pattern is invalid and will be skipped by the policy engine"
            );
        }
    }

    let mode = &config.procedure_control.mode;
    if mode != "whitelist" && mode != "blacklist" {
        warn!(mode, "unknown procedure_control.mode, defaulting to whitelist");
        config.procedure_control.mode = "whitelist".to_string();
    }

    info!(
        path = %path.display(),
        access_rules = config.access_control.len(),
        block_statements = config.sql_rules.block_statements.len(),
        block_patterns = config.sql_rules.block_patterns.len(),
        "policy loaded"
    );
    debug!(
        log_level = %config.global.log_level,
        log_format = %config.global.log_format,
        max_connections = config.global.max_connections,
        connection_timeout_sec = config.global.connection_timeout_sec,
        "policy global settings"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    const VALID_POLICY: &str = r#"
global:
  log_level: "info"
  max_connections: 100
access_control:
  - user: "testuser"
    source_ip: "192.168.1.0/24"
    allowed_tables: ["users", "orders"]
    allowed_operations: ["SELECT", "INSERT"]
sql_rules:
  block_statements: ["DROP", "TRUNCATE"]
  block_patterns:
    - "UNION\\s+SELECT"
procedure_control:
  mode: "whitelist"
  whitelist: ["monthly_report"]
data_protection:
  block_schema_access: true
"#;

    #[test]
    fn test_load_valid_policy() {
        let f = write_policy(VALID_POLICY);
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.global.max_connections, 100);
        assert_eq!(cfg.access_control.len(), 1);
        assert_eq!(cfg.sql_rules.block_statements, vec!["DROP", "TRUNCATE"]);
        assert_eq!(cfg.procedure_control.whitelist, vec!["monthly_report"]);
    }

    #[test]
    fn test_empty_block_patterns_rejected() {
        let f = write_policy("sql_rules:\n  block_patterns: []\n");
        let err = load(f.path()).unwrap_err();
        assert!(matches!(err, PolicyLoadError::Invalid(_)));

        let f = write_policy("access_control: []\n");
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/policy.yaml")).unwrap_err();
        assert!(matches!(err, PolicyLoadError::Io(_)));
    }

    #[test]
    fn test_broken_yaml() {
        let f = write_policy("sql_rules: [unclosed\n  - nope");
        let err = load(f.path()).unwrap_err();
        assert!(matches!(err, PolicyLoadError::Yaml(_)));
    }

    #[test]
    fn test_invalid_mode_falls_back_to_whitelist() {
        let f = write_policy(
            "sql_rules:\n  block_patterns: [\"x\"]\nprocedure_control:\n  mode: \"sometimes\"\n",
        );
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.procedure_control.mode, "whitelist");
    }

    #[test]
    fn test_invalid_block_pattern_survives_load() {
        let f = write_policy("sql_rules:\n  block_patterns: [\"(unclosed\", \"DROP\"]\n");
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.sql_rules.block_patterns.len(), 2);
    }
}

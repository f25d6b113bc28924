use regex::{Regex, RegexBuilder};
use tracing::{error, warn};

/// Default SQL injection patterns.
///
/// Case-insensitive, first match wins. Known gaps: comment splitting
/// (`UN/**/ION`), URL/hex encodings, and tautologies not starting with a
/// quote are not detected.
pub const DEFAULT_INJECTION_PATTERNS: &[&str] = &[
    r"UNION\s+SELECT",
    r#"'\s*OR\s+['"\d]"#,
    r"SLEEP\s*\(",
    r"BENCHMARK\s*\(",
    r"LOAD_FILE\s*\(",
    r"INTO\s+OUTFILE",
    r"INTO\s+DUMPFILE",
    r";\s*(DROP|DELETE|UPDATE|INSERT|ALTER|CREATE|CALL|PREPARE|EXECUTE|TRUNCATE)",
    r"--\s*$",
    r"/\*.*\*/",
];

/// Outcome of an injection check.
#[derive(Debug, Clone, Default)]
pub struct InjectionResult {
    pub detected: bool,
    /// Source text of the pattern that fired (empty when fail-close)
    pub matched_pattern: String,
    pub reason: String,
}

struct CompiledPattern {
    source: String,
    regex: Regex,
}

/// Regex-list injection detector.
///
/// Invalid patterns are logged and dropped at construction. If nothing
/// survives compilation the detector goes fail-close: every `check` reports
/// detected so a misconfiguration cannot silently expose the upstream.
pub struct InjectionDetector {
    patterns: Vec<CompiledPattern>,
    fail_close_active: bool,
}

impl InjectionDetector {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let pattern = pattern.as_ref();
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => compiled.push(CompiledPattern {
                    source: pattern.to_string(),
                    regex,
                }),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid injection pattern, skipping");
                }
            }
        }

        let fail_close_active = compiled.is_empty();
        if fail_close_active {
            error!("no valid injection patterns loaded, fail-close active: all SQL will be flagged");
        }

        Self {
            patterns: compiled,
            fail_close_active,
        }
    }

    pub fn with_default_patterns() -> Self {
        Self::new(DEFAULT_INJECTION_PATTERNS)
    }

    pub fn fail_close_active(&self) -> bool {
        self.fail_close_active
    }

    /// Test SQL against the pattern list; returns on the first match.
    pub fn check(&self, sql: &str) -> InjectionResult {
        if self.fail_close_active {
            return InjectionResult {
                detected: true,
                matched_pattern: String::new(),
                reason: "no valid patterns loaded".to_string(),
            };
        }

        for pattern in &self.patterns {
            if pattern.regex.is_match(sql) {
                return InjectionResult {
                    detected: true,
                    matched_pattern: pattern.source.clone(),
                    reason: format!("Matched injection pattern: {}", pattern.source),
                };
            }
        }

        InjectionResult::default()
    }
}

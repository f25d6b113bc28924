use serde::Deserialize;

/// Root of the policy file. Missing sections fall back to their defaults;
/// the loader enforces the invariants that serde cannot express.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub access_control: Vec<AccessRule>,
    #[serde(default)]
    pub sql_rules: SqlRules,
    #[serde(default)]
    pub procedure_control: ProcedureControl,
    #[serde(default)]
    pub data_protection: DataProtection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Accepts a bare number or a "30s"-style string (digits extracted)
    #[serde(
        rename = "connection_timeout",
        default = "default_connection_timeout",
        deserialize_with = "deserialize_timeout"
    )]
    pub connection_timeout_sec: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_max_connections() -> u32 {
    1000
}

fn default_connection_timeout() -> u32 {
    30
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => {
            let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            Ok(digits.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %s, "cannot parse connection_timeout, using default");
                default_connection_timeout()
            }))
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            max_connections: default_max_connections(),
            connection_timeout_sec: default_connection_timeout(),
        }
    }
}

/// User/IP access rule. The first matching rule decides;
/// `blocked_operations` wins over `allowed_operations`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccessRule {
    /// MySQL user name, "*" matches any
    #[serde(default)]
    pub user: String,
    /// IPv4 CIDR ("192.168.1.0/24"); empty matches any source
    #[serde(rename = "source_ip", default)]
    pub source_ip_cidr: String,
    /// "*" entry matches all tables; an explicitly empty list allows none
    #[serde(default = "default_allowed_tables")]
    pub allowed_tables: Vec<String>,
    /// Empty or containing "*" means no operation restriction
    #[serde(default)]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub blocked_operations: Vec<String>,
    #[serde(default)]
    pub time_restriction: Option<TimeRestriction>,
}

fn default_allowed_tables() -> Vec<String> {
    vec!["*".to_string()]
}

/// Access window in a named IANA zone.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeRestriction {
    /// "HH:MM-HH:MM"; a range with start > end wraps past midnight
    #[serde(rename = "allow", default = "default_allow_range")]
    pub allow_range: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_allow_range() -> String {
    "09:00-18:00".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SqlRules {
    /// Command names to refuse outright, e.g. ["DROP", "TRUNCATE"]
    #[serde(default)]
    pub block_statements: Vec<String>,
    /// Regex patterns matched against the raw SQL; must be non-empty at
    /// load time
    #[serde(default)]
    pub block_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcedureControl {
    /// "whitelist" or "blacklist"; the list below is read under either mode
    #[serde(default = "default_procedure_mode")]
    pub mode: String,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_true")]
    pub block_dynamic_sql: bool,
    #[serde(default = "default_true")]
    pub block_create_alter: bool,
}

fn default_procedure_mode() -> String {
    "whitelist".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProcedureControl {
    fn default() -> Self {
        Self {
            mode: default_procedure_mode(),
            whitelist: Vec::new(),
            block_dynamic_sql: true,
            block_create_alter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataProtection {
    /// 0 = unlimited
    #[serde(default)]
    pub max_result_rows: u32,
    #[serde(default = "default_true")]
    pub block_schema_access: bool,
}

impl Default for DataProtection {
    fn default() -> Self {
        Self {
            max_result_rows: 0,
            block_schema_access: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gets_defaults() {
        let cfg: PolicyConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.global.log_level, "info");
        assert_eq!(cfg.global.max_connections, 1000);
        assert_eq!(cfg.global.connection_timeout_sec, 30);
        assert!(cfg.access_control.is_empty());
        assert_eq!(cfg.procedure_control.mode, "whitelist");
        assert!(cfg.procedure_control.block_dynamic_sql);
        assert!(cfg.data_protection.block_schema_access);
        assert_eq!(cfg.data_protection.max_result_rows, 0);
    }

    #[test]
    fn test_timeout_string_form() {
        let cfg: PolicyConfig =
            serde_yaml::from_str("global:\n  connection_timeout: \"45s\"\n").unwrap();
        assert_eq!(cfg.global.connection_timeout_sec, 45);

        let cfg: PolicyConfig =
            serde_yaml::from_str("global:\n  connection_timeout: 15\n").unwrap();
        assert_eq!(cfg.global.connection_timeout_sec, 15);
    }

    #[test]
    fn test_access_rule_yaml_key_mapping() {
        let yaml = r#"
access_control:
  - user: "testuser"
    source_ip: "192.168.1.0/24"
    allowed_tables: ["users"]
    allowed_operations: ["SELECT"]
  - user: "*"
"#;
        let cfg: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.access_control.len(), 2);
        assert_eq!(cfg.access_control[0].source_ip_cidr, "192.168.1.0/24");
        assert_eq!(cfg.access_control[0].allowed_tables, vec!["users"]);
        // defaults: no source restriction, all tables
        assert!(cfg.access_control[1].source_ip_cidr.is_empty());
        assert_eq!(cfg.access_control[1].allowed_tables, vec!["*"]);
    }

    #[test]
    fn test_explicitly_empty_allowed_tables_stays_empty() {
        let yaml = "access_control:\n  - user: \"x\"\n    allowed_tables: []\n";
        let cfg: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.access_control[0].allowed_tables.is_empty());
    }

    #[test]
    fn test_time_restriction_mapping() {
        let yaml = r#"
access_control:
  - user: "ops"
    time_restriction:
      allow: "22:00-06:00"
      timezone: "Asia/Seoul"
"#;
        let cfg: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let tr = cfg.access_control[0].time_restriction.as_ref().unwrap();
        assert_eq!(tr.allow_range, "22:00-06:00");
        assert_eq!(tr.timezone, "Asia/Seoul");
    }
}

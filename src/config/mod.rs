use std::path::PathBuf;

use tracing::warn;

/// Process-level runtime configuration, read from environment variables.
/// Out-of-range or unparseable values fall back to their defaults with a
/// warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub upstream_addr: String,
    pub upstream_port: u16,
    pub policy_path: PathBuf,
    pub uds_socket_path: PathBuf,
    pub log_path: PathBuf,
    pub log_level: String,
    pub health_check_port: u16,
    pub max_connections: u32,
    pub connection_timeout_sec: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 13306,
            upstream_addr: "127.0.0.1".to_string(),
            upstream_port: 3306,
            policy_path: PathBuf::from("config/policy.yaml"),
            uds_socket_path: PathBuf::from("/tmp/sqlshield.sock"),
            log_path: PathBuf::from("/tmp/sqlshield.log"),
            log_level: "info".to_string(),
            health_check_port: 8080,
            max_connections: 1000,
            connection_timeout_sec: 30,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_str("PROXY_LISTEN_ADDR", defaults.listen_addr),
            listen_port: env_u16("PROXY_LISTEN_PORT", defaults.listen_port),
            upstream_addr: env_str("MYSQL_HOST", defaults.upstream_addr),
            upstream_port: env_u16("MYSQL_PORT", defaults.upstream_port),
            policy_path: PathBuf::from(env_str(
                "POLICY_PATH",
                defaults.policy_path.display().to_string(),
            )),
            uds_socket_path: PathBuf::from(env_str(
                "UDS_SOCKET_PATH",
                defaults.uds_socket_path.display().to_string(),
            )),
            log_path: PathBuf::from(env_str(
                "LOG_PATH",
                defaults.log_path.display().to_string(),
            )),
            log_level: env_str("LOG_LEVEL", defaults.log_level),
            health_check_port: env_u16("HEALTH_CHECK_PORT", defaults.health_check_port),
            max_connections: env_u32("MAX_CONNECTIONS", defaults.max_connections),
            connection_timeout_sec: env_u32(
                "CONNECTION_TIMEOUT_SEC",
                defaults.connection_timeout_sec,
            ),
        }
    }
}

fn env_str(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    if raw.is_empty() {
        return default;
    }
    match raw.parse::<u32>() {
        Ok(v) if (1..=65535).contains(&v) => v as u16,
        _ => {
            warn!(var = name, value = %raw, default, "invalid port value, using default");
            default
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    if raw.is_empty() {
        return default;
    }
    match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            warn!(var = name, value = %raw, default, "invalid value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // env-var tests mutate process state; each test uses its own variable
    // names to stay independent of ordering

    #[test]
    fn test_defaults() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.listen_port, 13306);
        assert_eq!(cfg.upstream_port, 3306);
        assert_eq!(cfg.max_connections, 1000);
        assert_eq!(cfg.connection_timeout_sec, 30);
    }

    #[test]
    fn test_env_u16_validation() {
        std::env::set_var("SQLSHIELD_TEST_PORT_OK", "4000");
        assert_eq!(env_u16("SQLSHIELD_TEST_PORT_OK", 1), 4000);

        std::env::set_var("SQLSHIELD_TEST_PORT_ZERO", "0");
        assert_eq!(env_u16("SQLSHIELD_TEST_PORT_ZERO", 7), 7);

        std::env::set_var("SQLSHIELD_TEST_PORT_BIG", "70000");
        assert_eq!(env_u16("SQLSHIELD_TEST_PORT_BIG", 7), 7);

        std::env::set_var("SQLSHIELD_TEST_PORT_TEXT", "lots");
        assert_eq!(env_u16("SQLSHIELD_TEST_PORT_TEXT", 7), 7);

        assert_eq!(env_u16("SQLSHIELD_TEST_PORT_UNSET", 9), 9);
    }

    #[test]
    fn test_env_u32_validation() {
        std::env::set_var("SQLSHIELD_TEST_MAX_OK", "250");
        assert_eq!(env_u32("SQLSHIELD_TEST_MAX_OK", 1), 250);

        std::env::set_var("SQLSHIELD_TEST_MAX_NEG", "-4");
        assert_eq!(env_u32("SQLSHIELD_TEST_MAX_NEG", 11), 11);

        assert_eq!(env_u32("SQLSHIELD_TEST_MAX_UNSET", 11), 11);
    }

    #[test]
    fn test_env_str_empty_falls_back() {
        std::env::set_var("SQLSHIELD_TEST_STR_EMPTY", "");
        assert_eq!(env_str("SQLSHIELD_TEST_STR_EMPTY", "dflt".into()), "dflt");

        std::env::set_var("SQLSHIELD_TEST_STR_SET", "value");
        assert_eq!(env_str("SQLSHIELD_TEST_STR_SET", "dflt".into()), "value");
    }
}

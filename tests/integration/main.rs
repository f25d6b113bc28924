//! Integration test entry point
//!
//! These tests drive a running sqlshield instance over its real sockets.
//! Run with: SQLSHIELD_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod proxy;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("SQLSHIELD_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Proxy endpoints under test, from environment
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub proxy_addr: String,
    pub health_addr: String,
    pub control_socket: String,
}

pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        proxy_addr: env::var("SQLSHIELD_TEST_PROXY_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:13306".to_string()),
        health_addr: env::var("SQLSHIELD_TEST_HEALTH_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        control_socket: env::var("SQLSHIELD_TEST_CONTROL_SOCKET")
            .unwrap_or_else(|_| "/tmp/sqlshield.sock".to_string()),
    }
}

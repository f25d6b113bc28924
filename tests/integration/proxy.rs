//! Wire-level checks against a live proxy (and its upstream MySQL).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use crate::{get_proxy_config, should_run_integration_tests};

const CLIENT_SSL: u32 = 1 << 11;
const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;

fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (header[3], payload)
}

fn greeting_capabilities(payload: &[u8]) -> u32 {
    assert_eq!(payload[0], 0x0A, "expected a Handshake v10 greeting");
    let nul = payload[1..].iter().position(|&b| b == 0).unwrap();
    let flags1_off = 1 + nul + 1 + 4 + 8 + 1;
    let flags2_off = flags1_off + 5;
    u16::from_le_bytes([payload[flags1_off], payload[flags1_off + 1]]) as u32
        | (u16::from_le_bytes([payload[flags2_off], payload[flags2_off + 1]]) as u32) << 16
}

#[test]
fn test_greeting_has_capabilities_stripped() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_proxy_config();

    let mut stream = TcpStream::connect(&config.proxy_addr).unwrap();
    let (_, greeting) = read_packet(&mut stream);
    let caps = greeting_capabilities(&greeting);

    assert_eq!(caps & CLIENT_SSL, 0, "CLIENT_SSL must be stripped");
    assert_eq!(
        caps & CLIENT_DEPRECATE_EOF,
        0,
        "CLIENT_DEPRECATE_EOF must be stripped"
    );
    assert_eq!(
        caps & CLIENT_QUERY_ATTRIBUTES,
        0,
        "CLIENT_QUERY_ATTRIBUTES must be stripped"
    );
}

#[test]
fn test_health_endpoint_responds() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_proxy_config();

    let mut stream = TcpStream::connect(&config.health_addr).unwrap();
    stream
        .write_all(b"GET /health HTTP/1.0\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(
        response.starts_with("HTTP/1.0 200") || response.starts_with("HTTP/1.1 200"),
        "unexpected response: {response}"
    );
    assert!(response.contains("\"status\""));
}

#[test]
fn test_control_socket_stats() {
    if !should_run_integration_tests() {
        return;
    }
    let config = get_proxy_config();

    let mut stream = UnixStream::connect(&config.control_socket).unwrap();
    let body = br#"{"command":"stats"}"#;
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .unwrap();
    stream.write_all(body).unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).unwrap();
    let mut reply = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    stream.read_exact(&mut reply).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value["ok"], true);
    assert!(value["payload"]["total_connections"].is_u64());
    assert!(value["payload"]["qps"].is_number());
}

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use colorcheck::publish::{PolledVariable, ServerError, ServerState, VariableServer};

fn server(pki: &tempfile::TempDir) -> VariableServer {
    let variable = Arc::new(PolledVariable::new(false, Duration::from_millis(1000)));
    VariableServer::new("127.0.0.1", variable).with_pki_dir(pki.path())
}

/// OPC UA binary Hello, one final chunk.
fn hello(endpoint: &str) -> Vec<u8> {
    let mut body = Vec::new();
    // protocol version, receive/send buffer size, max message size, max chunks
    for field in [0u32, 65_536, 65_536, 0, 0] {
        body.extend_from_slice(&field.to_le_bytes());
    }
    body.extend_from_slice(&(endpoint.len() as i32).to_le_bytes());
    body.extend_from_slice(endpoint.as_bytes());

    let mut message = b"HELF".to_vec();
    message.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    message.extend(body);
    message
}

fn handshake(addr: SocketAddr, endpoint: &str) -> [u8; 8] {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&hello(endpoint)).unwrap();
    let mut header = [0; 8];
    stream.read_exact(&mut header).unwrap();
    header
}

#[test]
fn lifecycle_rejects_reentrant_transitions() {
    let pki = tempfile::tempdir().unwrap();
    let server = server(&pki);
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(matches!(server.shutdown(), Err(ServerError::NotRunning)));
    assert_eq!(server.state(), ServerState::Stopped);

    server.launch(0).unwrap();
    assert_eq!(server.state(), ServerState::Running);
    assert!(matches!(server.launch(0), Err(ServerError::AlreadyRunning)));
    assert_eq!(server.state(), ServerState::Running);

    server.shutdown().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());
    assert!(server.published_value().is_none());
    assert!(matches!(server.shutdown(), Err(ServerError::NotRunning)));
}

#[test]
fn accepts_an_opc_ua_hello() {
    let pki = tempfile::tempdir().unwrap();
    let server = server(&pki);
    let addr = server.launch(0).unwrap();
    let endpoint = server.endpoint_url().unwrap();
    assert_eq!(endpoint, format!("opc.tcp://127.0.0.1:{}/", addr.port()));

    let header = handshake(addr, &endpoint);
    assert_eq!(&header[..4], b"ACKF");

    server.shutdown().unwrap();
}

#[test]
fn node_follows_the_polled_variable() {
    let pki = tempfile::tempdir().unwrap();
    let server = server(&pki);
    server.launch(0).unwrap();
    assert_eq!(server.published_value(), Some(false));

    server.variable().update(true);
    assert_eq!(server.published_value(), Some(true));

    server.shutdown().unwrap();
    // Writes while stopped are picked up by the next launch
    server.variable().update(false);
    server.launch(0).unwrap();
    assert_eq!(server.published_value(), Some(false));

    server.shutdown().unwrap();
}

#[test]
fn restart_moves_to_a_new_listener() {
    let pki = tempfile::tempdir().unwrap();
    let server = server(&pki);
    server.launch(0).unwrap();
    let second = server.restart(0).unwrap();
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.local_addr(), Some(second));
    let endpoint = server.endpoint_url().unwrap();
    assert_eq!(&handshake(second, &endpoint)[..4], b"ACKF");

    server.shutdown().unwrap();

    // Restarting a stopped server simply launches it
    server.restart(0).unwrap();
    assert_eq!(server.state(), ServerState::Running);
}

#[test]
fn bind_failure_leaves_the_server_stopped() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let pki = tempfile::tempdir().unwrap();
    let server = server(&pki);
    assert!(matches!(server.launch(port), Err(ServerError::Bind { .. })));
    assert_eq!(server.state(), ServerState::Stopped);
}

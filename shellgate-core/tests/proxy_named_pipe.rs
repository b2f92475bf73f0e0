//! End-to-end tests for named-pipe servers (Unix domain sockets on Unix).
#![cfg(unix)]

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use helpers::{FakeShell, fast_defaults, pid_alive};
use shellgate_core::manager::{ServerSelector, start_server, stop_server};
use shellgate_core::transport::named_pipe::socket_path;
use shellgate_core::{AddressKey, BoundAddress, ServerRegistry, ServerSpec, TransportKind};

fn pipe_name(server: &shellgate_core::ProxyServer) -> String {
    match server.bound_address() {
        Some(BoundAddress::Pipe(name)) => name,
        other => panic!("expected a pipe address, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_named_pipe_round_trip() {
    let shell = FakeShell::echo();
    let registry = Arc::new(ServerRegistry::new());
    let server = start_server(
        &registry,
        &ServerSpec::new(TransportKind::NamedPipe),
        &fast_defaults(),
        shell.locator(),
    )
    .await
    .unwrap();

    let name = pipe_name(&server);
    assert!(name.starts_with("shellgate-"));
    assert!(server.name().starts_with("named_pipe-"));
    assert!(registry.lookup_by_address(&AddressKey::Pipe(name.clone())).is_some());

    let path = socket_path(&name);
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"over the pipe").await.unwrap();
    let mut buf = [0u8; 13];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("pipe echo timed out")
        .unwrap();
    assert_eq!(&buf, b"over the pipe");

    let pid = server.connections().records()[0].subprocess_id;
    stop_server(&registry, &ServerSelector::Address(AddressKey::Pipe(name)), true)
        .await
        .unwrap();

    assert!(!pid_alive(pid));
    assert!(!path.exists());
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_named_pipe_conflict() {
    let shell = FakeShell::echo();
    let registry = Arc::new(ServerRegistry::new());
    let name = format!("shellgate-test-{}", std::process::id());

    let mut spec = ServerSpec::new(TransportKind::NamedPipe);
    spec.pipe_name = Some(name.clone());
    let first = start_server(&registry, &spec, &fast_defaults(), shell.locator())
        .await
        .unwrap();
    assert_eq!(first.name(), format!("named_pipe-{name}"));

    spec.name = Some("second".to_string());
    let err = start_server(&registry, &spec, &fast_defaults(), shell.locator())
        .await
        .unwrap_err();
    assert_eq!(err.error_id(), "ServerAddressInUse");

    first.stop(false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipe_path_over_regular_file_fails_to_bind() {
    let shell = FakeShell::echo();
    let registry = Arc::new(ServerRegistry::new());
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("important.txt");
    std::fs::write(&victim, "precious data").unwrap();

    let mut spec = ServerSpec::new(TransportKind::NamedPipe);
    spec.name = Some("over-file".to_string());
    spec.pipe_name = Some(victim.display().to_string());
    let err = start_server(&registry, &spec, &fast_defaults(), shell.locator())
        .await
        .unwrap_err();

    assert_eq!(err.error_id(), "ServerBindFailed");
    assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious data");
    assert!(registry.is_empty());
}

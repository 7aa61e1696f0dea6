//! Recovery behavior across tunnels and the instrument manager: stale
//! handles, bounded resolution, and the single-retry policy.

use lablink::client::registry::InstrumentManager;
use lablink::config::{DriverConfig, Settings, TunnelSpec};
use lablink::driver::mock::MockDriver;
use lablink::driver::registry::DriverRegistry;
use lablink::driver::ParamValue;
use lablink::error::LabError;
use lablink::server::InstrumentServer;
use lablink::tunnel::{TcpForwardTransport, Tunnel, TunnelState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn mock_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::empty();
    registry.register("mock", |name| Box::new(MockDriver::new(name)));
    registry
}

fn server_settings(names: &[&str], listen_addr: &str) -> Settings {
    let mut settings = Settings::default();
    settings.server.listen_addr = listen_addr.to_string();
    for name in names {
        settings.drivers.push(DriverConfig {
            name: (*name).to_string(),
            kind: "mock".to_string(),
            connection_params: HashMap::new(),
        });
    }
    settings
}

fn tunnel_spec(local_port: u16) -> TunnelSpec {
    TunnelSpec {
        remote_host: "lab-remote".to_string(),
        remote_user: "operator".to_string(),
        local_port,
        remote_port: 42068,
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_secs(1),
        max_reconnect_attempts: 5,
        initial_backoff: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_resolve_unknown_driver_fails_fast() {
    let server = InstrumentServer::start(&server_settings(&["dev"], "127.0.0.1:0"), &mock_registry())
        .await
        .unwrap();
    let mut manager = InstrumentManager::new(TIMEOUT);
    manager.register_gateway(server.local_addr().to_string());

    let result = tokio::time::timeout(TIMEOUT, manager.resolve("no_such_device"))
        .await
        .expect("resolve did not complete in bounded time");
    assert!(matches!(result, Err(LabError::DriverNotFound(_))));

    // A real driver on the same gateway still resolves.
    let handle = manager.resolve("dev").await.unwrap();
    assert_eq!(handle.endpoint, server.local_addr().to_string());

    server.stop().await;
}

#[tokio::test]
async fn test_stale_handle_detected_after_server_restart() {
    let first = InstrumentServer::start(&server_settings(&["dev"], "127.0.0.1:0"), &mock_registry())
        .await
        .unwrap();
    let endpoint = first.local_addr().to_string();
    let first_instance = first.instance_id();

    let mut manager = InstrumentManager::new(TIMEOUT);
    manager.register_gateway(endpoint.clone());
    let handle = manager.resolve("dev").await.unwrap();
    assert_eq!(handle.instance_id, first_instance);
    manager.invoke(&handle, "echo", vec![ParamValue::Int(1)]).await.unwrap();

    // Same port, different process identity.
    first.stop().await;
    let second = InstrumentServer::start(&server_settings(&["dev"], &endpoint), &mock_registry())
        .await
        .unwrap();
    assert_ne!(second.instance_id(), first_instance);

    // The dead connection makes the first attempt a transport failure; the
    // retry re-resolves against the new instance and succeeds, and the fresh
    // handle is bound to the new identity.
    manager
        .invoke(&handle, "echo", vec![ParamValue::Int(2)])
        .await
        .unwrap();
    let fresh = manager.resolve("dev").await.unwrap();
    assert_eq!(fresh.instance_id, second.instance_id());

    // The old handle names an instance that no longer exists; reusing it
    // against the live connection is refused rather than silently redirected.
    let err = manager
        .invoke(&handle, "echo", vec![ParamValue::Int(3)])
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::RemoteCall(_)), "{err:?}");

    second.stop().await;
}

#[tokio::test]
async fn test_tunnel_drop_midflight_then_recovery_without_reresolve() {
    let server = InstrumentServer::start(&server_settings(&["dev"], "127.0.0.1:0"), &mock_registry())
        .await
        .unwrap();
    let target = server.local_addr().to_string();
    let local_port = 48161;
    let transport = Arc::new(TcpForwardTransport {
        target: target.clone(),
    });

    let tunnel = Tunnel::open(tunnel_spec(local_port), transport.clone());
    tunnel.wait_established(TIMEOUT).await.unwrap();

    let mut manager = InstrumentManager::new(Duration::from_secs(1));
    manager.register_gateway(tunnel.local_endpoint());
    let handle = manager.resolve("dev").await.unwrap();
    manager.invoke(&handle, "echo", vec![ParamValue::Int(1)]).await.unwrap();

    // Sever the forward. The next call fails at the transport level, the
    // automatic retry cannot reach the gateway either, and the caller gets a
    // remote-call error rather than a hang.
    tunnel.close().await;
    let err = manager
        .invoke(&handle, "echo", vec![ParamValue::Int(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::RemoteCall(_)), "{err:?}");

    // Forward comes back on the same local port; the original handle works
    // again with no explicit re-resolution by the caller.
    let tunnel = Tunnel::open(tunnel_spec(local_port), transport);
    tunnel.wait_established(TIMEOUT).await.unwrap();
    let echoed = manager
        .invoke(&handle, "echo", vec![ParamValue::Int(3)])
        .await
        .unwrap();
    assert_eq!(echoed, ParamValue::Int(3));

    tunnel.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_heartbeat_survives_while_server_lives() {
    let server = InstrumentServer::start(&server_settings(&["dev"], "127.0.0.1:0"), &mock_registry())
        .await
        .unwrap();
    let transport = Arc::new(TcpForwardTransport {
        target: server.local_addr().to_string(),
    });

    let tunnel = Tunnel::open(tunnel_spec(48175), transport);
    tunnel.wait_established(TIMEOUT).await.unwrap();

    // Several heartbeat intervals pass without a state regression.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(tunnel.state(), TunnelState::Established);

    tunnel.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_target_reports_lost_after_bounded_retries() {
    // Nothing listens on the target; establishment succeeds (the relay binds)
    // but the first heartbeat fails, so the session degrades and retries
    // until the attempt budget runs out.
    let transport = Arc::new(TcpForwardTransport {
        target: "127.0.0.1:48199".to_string(),
    });
    let mut spec = tunnel_spec(48189);
    spec.max_reconnect_attempts = 2;
    spec.initial_backoff = Duration::from_millis(20);
    spec.heartbeat_timeout = Duration::from_millis(300);

    let tunnel = Tunnel::open(spec, transport);
    let mut lost_rx = tunnel.subscribe_lost();
    let host = tokio::time::timeout(TIMEOUT, lost_rx.recv())
        .await
        .expect("lost notification never arrived")
        .unwrap();
    assert_eq!(host, "lab-remote");
    assert_eq!(tunnel.state(), TunnelState::Closed);
}

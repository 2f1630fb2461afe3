//! End-to-end lifecycle tests driving the manager through the fake backend.

use std::task::Poll;
use std::time::Duration;

use futures::StreamExt;
use keel_tunnel::{
    BackendError, Cidr, CommandOutcome, CommandPolicy, FakeBackend, LinkState, ManagerConfig,
    PeerConfigurationBuilder, PermissionKind, PermissionRequest, PermissionStatus, PrivateKey,
    PublicKey, StateSubscription, TunnelConfiguration, TunnelConfigurationBuilder, TunnelError,
    TunnelManager, TunnelState,
};
use tokio_test::{assert_pending, task};

fn config() -> TunnelConfiguration {
    let peer = PeerConfigurationBuilder::new()
        .public_key(PublicKey::from_bytes_array([2u8; 32]))
        .endpoint("192.168.1.100:51820".parse().expect("valid endpoint"))
        .allowed_ip(Cidr::from_cidr("0.0.0.0/0").expect("valid prefix"))
        .persistent_keepalive(25)
        .build()
        .expect("valid peer");

    TunnelConfigurationBuilder::new()
        .local_address(Cidr::from_cidr("10.100.0.2/24").expect("valid prefix"))
        .private_key(PrivateKey::from_bytes_array([1u8; 32]))
        .dns("8.8.8.8".parse().expect("valid address"))
        .peer(peer)
        .build()
        .expect("valid config")
}

fn other_config() -> TunnelConfiguration {
    let peer = PeerConfigurationBuilder::new()
        .public_key(PublicKey::from_bytes_array([3u8; 32]))
        .endpoint("vpn.example.com:51820".parse().expect("valid endpoint"))
        .allowed_ip(Cidr::from_cidr("10.9.0.0/16").expect("valid prefix"))
        .build()
        .expect("valid peer");

    TunnelConfigurationBuilder::new()
        .local_address(Cidr::from_cidr("10.9.0.2/24").expect("valid prefix"))
        .private_key(PrivateKey::from_bytes_array([4u8; 32]))
        .peer(peer)
        .build()
        .expect("valid config")
}

fn setup(backend: FakeBackend, policy: CommandPolicy) -> TunnelManager<FakeBackend> {
    TunnelManager::new(backend, ManagerConfig::default().with_policy(policy))
        .expect("valid manager")
}

fn drain(sub: &mut StateSubscription) -> Vec<TunnelState> {
    std::iter::from_fn(|| sub.try_next()).collect()
}

fn consent() -> PermissionRequest {
    PermissionRequest::new(PermissionKind::VpnConsent, "allow keel to create a VPN")
}

async fn wait_for_apply(backend: &FakeBackend) {
    while backend.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn connect_and_disconnect_publish_every_state() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();

    assert_eq!(
        manager.connect(config()).await.expect("connect"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    assert_eq!(
        drain(&mut sub),
        vec![TunnelState::Down, TunnelState::Connecting, TunnelState::Up]
    );

    assert_eq!(
        manager.disconnect().await.expect("disconnect"),
        CommandOutcome::Applied(TunnelState::Down)
    );
    assert_eq!(drain(&mut sub), vec![TunnelState::Disconnecting, TunnelState::Down]);
    assert_eq!(backend.apply_count(LinkState::Up), 1);
    assert_eq!(backend.apply_count(LinkState::Down), 1);
}

#[tokio::test]
async fn failed_connect_becomes_error_and_retry_succeeds() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();
    backend.fail_next(BackendError::Handshake("no response from peer".into()));

    let outcome = manager.connect(config()).await.expect("connect");
    assert!(outcome.is_error());
    let reason = manager.current_state().error_reason().map(ToString::to_string);
    assert_eq!(reason.as_deref(), Some("handshake failed: no response from peer"));

    assert_eq!(
        manager.reconnect().await.expect("retry"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    let states = drain(&mut sub);
    assert_eq!(states.len(), 5);
    assert!(matches!(states[2], TunnelState::Error(_)));
    assert_eq!(states[3..], [TunnelState::Connecting, TunnelState::Up]);
    assert_eq!(backend.apply_count(LinkState::Up), 2);
}

#[tokio::test]
async fn connect_from_error_uses_new_configuration() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();
    backend.fail_next(BackendError::Other("boom".into()));
    manager.connect(config()).await.expect("connect");

    let other = other_config();
    assert_eq!(
        manager.connect(other.clone()).await.expect("connect with new config"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    assert_eq!(
        drain(&mut sub),
        vec![
            TunnelState::Down,
            TunnelState::Connecting,
            TunnelState::Error("boom".into()),
            TunnelState::Connecting,
            TunnelState::Up,
        ]
    );
    assert_eq!(manager.retained_configuration().as_deref(), Some(&other));
    assert_eq!(backend.last_config(), Some(other));
    assert_eq!(backend.apply_count(LinkState::Up), 2);
}

#[tokio::test]
async fn disconnect_from_error_retries_teardown() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    backend.fail_next(BackendError::Other("boom".into()));
    manager.connect(config()).await.expect("connect");
    let mut sub = manager.subscribe();

    assert_eq!(
        manager.disconnect().await.expect("disconnect"),
        CommandOutcome::Applied(TunnelState::Down)
    );
    assert_eq!(
        drain(&mut sub),
        vec![
            TunnelState::Error("boom".into()),
            TunnelState::Disconnecting,
            TunnelState::Down,
        ]
    );
    assert_eq!(backend.apply_count(LinkState::Down), 1);
}

#[tokio::test]
async fn failed_disconnect_can_be_retried() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    manager.connect(config()).await.expect("connect");

    backend.fail_next(BackendError::Other("wg-quick down failed".into()));
    assert_eq!(
        manager.disconnect().await.expect("disconnect"),
        CommandOutcome::Applied(TunnelState::Error("wg-quick down failed".into()))
    );
    assert_eq!(
        manager.disconnect().await.expect("retry disconnect"),
        CommandOutcome::Applied(TunnelState::Down)
    );
    assert_eq!(backend.apply_count(LinkState::Down), 2);
    assert_eq!(
        manager.disconnect().await.expect("disconnect while down"),
        CommandOutcome::Unchanged(TunnelState::Down)
    );
    assert_eq!(backend.apply_count(LinkState::Down), 2);
}

#[tokio::test]
async fn disconnect_while_down_makes_no_backend_call() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);

    assert_eq!(
        manager.disconnect().await.expect("disconnect"),
        CommandOutcome::Unchanged(TunnelState::Down)
    );
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn permission_blocks_connect_until_granted() {
    let backend = FakeBackend::new().with_permission_request(consent());
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();

    let outcome = manager.connect(config()).await.expect("connect");
    assert_eq!(outcome, CommandOutcome::PermissionRequired(consent()));
    assert_eq!(manager.current_state(), TunnelState::Down);
    assert_eq!(manager.permission(), PermissionStatus::Pending(consent()));
    assert!(backend.calls().is_empty());

    backend.grant_permission();
    assert_eq!(
        manager.on_permission_result(true).await.expect("grant"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    assert_eq!(manager.permission(), PermissionStatus::Granted);
    assert_eq!(backend.apply_count(LinkState::Up), 1);
    assert_eq!(backend.last_config(), Some(config()));
    assert_eq!(
        drain(&mut sub),
        vec![TunnelState::Down, TunnelState::Connecting, TunnelState::Up]
    );
}

#[tokio::test]
async fn permission_denied_leaves_tunnel_down() {
    let backend = FakeBackend::new().with_permission_request(consent());
    let manager = setup(backend.clone(), CommandPolicy::Queue);

    manager.connect(config()).await.expect("connect");
    let result = manager.on_permission_result(false).await;

    assert_eq!(result, Err(TunnelError::PermissionDenied));
    assert_eq!(manager.current_state(), TunnelState::Down);
    assert_eq!(manager.permission(), PermissionStatus::Denied);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn denied_permission_is_asked_again_on_next_connect() {
    let backend = FakeBackend::new().with_permission_request(consent());
    let manager = setup(backend.clone(), CommandPolicy::Queue);

    manager.connect(config()).await.expect("connect");
    let _ = manager.on_permission_result(false).await;

    let outcome = manager.connect(config()).await.expect("connect again");
    assert_eq!(outcome, CommandOutcome::PermissionRequired(consent()));
    assert_eq!(backend.permission_queries(), 2);
}

#[tokio::test]
async fn concurrent_connects_apply_once() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    backend.hold_applies();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(config()).await }
    });
    wait_for_apply(&backend).await;
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(config()).await }
    });
    tokio::task::yield_now().await;
    assert!(manager.is_busy());

    backend.release(1);
    let first = first.await.expect("join").expect("connect");
    let second = second.await.expect("join").expect("connect");

    assert_eq!(first, CommandOutcome::Applied(TunnelState::Up));
    assert_eq!(second, CommandOutcome::Unchanged(TunnelState::Up));
    assert_eq!(backend.apply_count(LinkState::Up), 1);
    assert_eq!(backend.peak_in_flight(), 1);
}

#[tokio::test]
async fn disconnect_queued_behind_connect() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();
    backend.hold_applies();

    let connect = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(config()).await }
    });
    wait_for_apply(&backend).await;

    let mut disconnect = task::spawn(manager.disconnect());
    assert_pending!(disconnect.poll());
    assert_eq!(manager.current_state(), TunnelState::Connecting);

    backend.stop_holding();
    assert_eq!(
        connect.await.expect("join").expect("connect"),
        CommandOutcome::Applied(TunnelState::Up)
    );

    let outcome = loop {
        if let Poll::Ready(outcome) = disconnect.poll() {
            break outcome;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(outcome, Ok(CommandOutcome::Applied(TunnelState::Down)));
    assert_eq!(
        drain(&mut sub),
        vec![
            TunnelState::Down,
            TunnelState::Connecting,
            TunnelState::Up,
            TunnelState::Disconnecting,
            TunnelState::Down,
        ]
    );
    assert_eq!(backend.peak_in_flight(), 1);
}

#[tokio::test]
async fn reject_policy_refuses_overlapping_command() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Reject);
    backend.hold_applies();

    let connect = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(config()).await }
    });
    wait_for_apply(&backend).await;

    assert_eq!(manager.disconnect().await, Err(TunnelError::Busy));
    assert_eq!(manager.toggle().await, Err(TunnelError::Busy));

    backend.release(1);
    assert_eq!(
        connect.await.expect("join").expect("connect"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    assert_eq!(backend.apply_count(LinkState::Down), 0);
}

#[tokio::test]
async fn late_subscriber_gets_latest_state() {
    let manager = setup(FakeBackend::new(), CommandPolicy::Queue);
    manager.connect(config()).await.expect("connect");

    let mut sub = manager.subscribe();
    assert_eq!(sub.next().await, Some(TunnelState::Up));
    assert_eq!(sub.try_next(), None);
}

#[tokio::test]
async fn spontaneous_down_while_up() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    manager.connect(config()).await.expect("connect");
    let mut sub = manager.subscribe();

    backend.simulate_report(LinkState::Down);

    assert_eq!(manager.current_state(), TunnelState::Down);
    assert_eq!(drain(&mut sub), vec![TunnelState::Up, TunnelState::Down]);
    assert!(manager.retained_configuration().is_some());
}

#[tokio::test]
async fn intermediate_reports_do_not_disturb_transition() {
    let backend = FakeBackend::new().with_intermediate_report(LinkState::Down);
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();

    manager.connect(config()).await.expect("connect");

    assert_eq!(
        drain(&mut sub),
        vec![TunnelState::Down, TunnelState::Connecting, TunnelState::Up]
    );
}

#[tokio::test]
async fn settling_report_is_not_published_twice() {
    let backend = FakeBackend::new().with_intermediate_report(LinkState::Up);
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    let mut sub = manager.subscribe();

    manager.connect(config()).await.expect("connect");

    assert_eq!(
        drain(&mut sub),
        vec![TunnelState::Down, TunnelState::Connecting, TunnelState::Up]
    );
}

#[tokio::test]
async fn backend_panic_becomes_error() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    backend.panic_next();

    let outcome = manager.connect(config()).await.expect("connect");
    assert!(outcome.is_error());
    let reason = manager.current_state().error_reason().map(ToString::to_string);
    assert!(reason.is_some_and(|r| r.contains("panicked")));

    assert_eq!(
        manager.reconnect().await.expect("retry"),
        CommandOutcome::Applied(TunnelState::Up)
    );
}

#[tokio::test]
async fn toggle_follows_retained_configuration() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);

    assert_eq!(manager.toggle().await, Err(TunnelError::NoConfiguration));
    assert_eq!(manager.reconnect().await, Err(TunnelError::NoConfiguration));

    manager.connect(config()).await.expect("connect");
    assert_eq!(
        manager.toggle().await.expect("toggle"),
        CommandOutcome::Applied(TunnelState::Down)
    );
    assert_eq!(
        manager.toggle().await.expect("toggle"),
        CommandOutcome::Applied(TunnelState::Up)
    );
    assert_eq!(backend.apply_count(LinkState::Up), 2);
}

#[tokio::test]
async fn dropped_command_still_settles() {
    let backend = FakeBackend::new();
    let manager = setup(backend.clone(), CommandPolicy::Queue);
    backend.hold_applies();

    let connect = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(config()).await }
    });
    wait_for_apply(&backend).await;
    connect.abort();
    let _ = connect.await;

    backend.release(1);
    let mut sub = manager.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = sub.next().await {
            if state == TunnelState::Up {
                break;
            }
        }
    })
    .await
    .expect("transition settles");

    assert!(!manager.is_busy());
    assert_eq!(
        manager.disconnect().await.expect("disconnect"),
        CommandOutcome::Applied(TunnelState::Down)
    );
}

mod common;

use common::{harness, session_config, HarnessBuilder, APPLICATION_ID};
use proxycore_session::{
    ConnectionStatus, PermissionStatus, SessionConfig, SessionError, SessionEvent, SessionState,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_default_start() {
    let h = harness().await;
    let mut statuses = h.controller.subscribe();

    h.controller.start(&session_config()).await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Running);

    let request = h.allocator.last_request().unwrap();
    assert_eq!(request.session_name, "proxycore-vpn");
    assert_eq!(request.mtu, 1500);
    assert_eq!(request.ipv4.to_string(), "198.18.0.1/24");
    assert_eq!(request.ipv6.to_string(), "fc00::1/64");
    let routes: Vec<String> = request.routes.iter().map(ToString::to_string).collect();
    assert_eq!(routes, vec!["0.0.0.0/0", "::/0"]);
    assert_eq!(*h.allocator.exclusions.lock().unwrap(), vec![APPLICATION_ID]);

    let started = h.provider.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].core_name, "xray");
    assert_eq!(started[0].port, 2080);
    assert_eq!(started[0].address, "127.0.0.1");

    let snapshot = h.controller.snapshot().await;
    let interface = snapshot.interface.unwrap();
    assert!(interface.is_detached());
    assert_eq!(Some(interface.descriptor), h.provider.tunnel_fd());
    assert_eq!(snapshot.permission, PermissionStatus::Granted);

    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connected);
    assert_eq!(h.controller.last_status(), Some(ConnectionStatus::Connected));
    assert_eq!(h.consent.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_persists_listener_settings() {
    let h = harness().await;
    let config = SessionConfig::builder()
        .core_name("xray")
        .port(7890)
        .mtu(1400)
        .build()
        .unwrap();

    h.controller.start(&config).await.unwrap();

    let persisted = h.provider.profile().unwrap().configuration().unwrap();
    assert_eq!(persisted.port, 7890);
    assert_eq!(persisted.mtu, 1400);
    assert_eq!(h.allocator.last_request().unwrap().mtu, 1400);
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let h = harness().await;

    h.controller.stop().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.provider.stop_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.controller.last_status(), None);
    assert!(h.controller.snapshot().await.interface.is_none());
}

#[tokio::test]
async fn test_stop_running_session() {
    let h = harness().await;
    let mut statuses = h.controller.subscribe();

    h.controller.start(&session_config()).await.unwrap();
    h.controller.stop().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.provider.stop_calls.load(Ordering::SeqCst), 1);
    assert!(h.provider.tunnel_fd().is_none());
    assert!(h.controller.snapshot().await.interface.is_none());

    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connected);
    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_stop_error_still_cleans_up() {
    let h = harness().await;
    h.controller.start(&session_config()).await.unwrap();
    h.provider.fail_stop.store(true, Ordering::SeqCst);

    let result = h.controller.stop().await;

    assert!(matches!(result, Err(SessionError::Platform(_))));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.controller.snapshot().await.interface.is_none());
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let h = harness().await;
    h.controller.start(&session_config()).await.unwrap();
    let before = h.controller.snapshot().await.interface.unwrap();

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::AlreadyRunning)));
    assert_eq!(h.controller.state(), SessionState::Running);
    assert_eq!(h.controller.snapshot().await.interface, Some(before));
    assert_eq!(h.provider.started().len(), 1);
    assert_eq!(h.allocator.established.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_starts_queue() {
    let h = harness().await;
    let config = session_config();

    let (first, second) = tokio::join!(h.controller.start(&config), h.controller.start(&config));

    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(
        first.err().or(second.err()),
        Some(SessionError::AlreadyRunning)
    ));
    assert_eq!(h.provider.started().len(), 1);
}

#[tokio::test]
async fn test_cleanup_from_running() {
    let h = harness().await;
    h.controller.start(&session_config()).await.unwrap();

    h.controller.cleanup().await;
    h.controller.cleanup().await;

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.interface.is_none());
    // The provider owns the transferred descriptor; cleanup leaves it alone
    assert!(h.provider.tunnel_fd().is_some());
    assert_eq!(h.allocator.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_consent_granted_by_user() {
    let h = HarnessBuilder::default().consent_granted(false).build().await;
    assert_eq!(h.controller.permission_status(), PermissionStatus::Pending);

    let start = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.start(&session_config()).await })
    };
    timeout(TEST_TIMEOUT, h.consent.launched.notified()).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Negotiating);

    h.controller
        .event_sink()
        .submit(SessionEvent::ConsentResult { granted: true });

    timeout(TEST_TIMEOUT, start).await.unwrap().unwrap().unwrap();
    assert_eq!(h.controller.state(), SessionState::Running);
    assert_eq!(h.controller.permission_status(), PermissionStatus::Granted);
}

#[tokio::test]
async fn test_permission_denied() {
    let h = HarnessBuilder::default().consent_granted(false).build().await;

    let start = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.start(&session_config()).await })
    };
    timeout(TEST_TIMEOUT, h.consent.launched.notified()).await.unwrap();

    h.controller
        .event_sink()
        .submit(SessionEvent::ConsentResult { granted: false });

    let result = timeout(TEST_TIMEOUT, start).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::PermissionDenied)));

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.permission, PermissionStatus::Denied);
    assert!(snapshot.interface.is_none());
    assert_eq!(h.allocator.established.load(Ordering::SeqCst), 0);
    assert!(h.provider.started().is_empty());
}

#[tokio::test]
async fn test_consent_prompt_unavailable() {
    let h = HarnessBuilder::default().consent_granted(false).build().await;
    h.consent.refuse_prompt.store(true, Ordering::SeqCst);

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::PermissionDenied)));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.permission_status(), PermissionStatus::Pending);
}

#[tokio::test]
async fn test_prepare_during_start_reports_negotiation() {
    let h = HarnessBuilder::default().consent_granted(false).build().await;

    let start = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.start(&session_config()).await })
    };
    timeout(TEST_TIMEOUT, h.consent.launched.notified()).await.unwrap();

    let result = h.controller.prepare().await;
    assert!(matches!(result, Err(SessionError::NegotiationInProgress)));

    h.controller
        .event_sink()
        .submit(SessionEvent::ConsentResult { granted: true });
    timeout(TEST_TIMEOUT, start).await.unwrap().unwrap().unwrap();
    assert_eq!(h.consent.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_back_to_back_start_replaces_prior_tunnel() {
    let h = harness().await;
    h.controller.start(&session_config()).await.unwrap();

    // A restarted app finds the previous tunnel still up
    let restarted = h.second_controller().await;
    restarted.start(&session_config()).await.unwrap();

    assert_eq!(h.provider.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.started().len(), 2);
    assert_eq!(h.allocator.established.load(Ordering::SeqCst), 2);
    assert_eq!(restarted.state(), SessionState::Running);

    let interface = restarted.snapshot().await.interface.unwrap();
    assert_eq!(Some(interface.descriptor), h.provider.tunnel_fd());
}

#[tokio::test]
async fn test_prior_tunnel_that_never_settles() {
    let h = harness().await;
    h.provider.set_status(proxycore_session::PlatformStatus::Connected);
    h.provider.linger_on_stop.store(true, Ordering::SeqCst);

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::EstablishmentFailed(_))));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.allocator.established.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_establishment_failure_reverts() {
    let h = harness().await;
    h.allocator.fail.store(true, Ordering::SeqCst);

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::EstablishmentFailed(_))));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.controller.snapshot().await.interface.is_none());
    assert!(h.provider.started().is_empty());
}

#[tokio::test]
async fn test_provider_start_failure_reverts() {
    let h = harness().await;
    h.provider.fail_start.store(true, Ordering::SeqCst);

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::Platform(_))));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.controller.snapshot().await.interface.is_none());
    // The descriptor was already handed over, so the guard does not close it
    assert_eq!(h.allocator.closes.load(Ordering::SeqCst), 0);

    h.provider.fail_start.store(false, Ordering::SeqCst);
    h.controller.start(&session_config()).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Running);
}

#[tokio::test]
async fn test_exclusion_failure_is_not_fatal() {
    let h = harness().await;
    h.allocator.exclusion_fails.store(true, Ordering::SeqCst);

    h.controller.start(&session_config()).await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Running);
    assert_eq!(h.allocator.exclusions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_without_profile() {
    let h = HarnessBuilder::default().with_profile(false).build().await;

    let result = h.controller.start(&session_config()).await;

    assert!(matches!(result, Err(SessionError::ManagerNotInitialized)));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.consent.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prepare_creates_profile() {
    let h = HarnessBuilder::default().with_profile(false).build().await;

    let permission = h.controller.prepare().await.unwrap();

    assert_eq!(permission, PermissionStatus::Granted);
    let profile = h.provider.profile().unwrap();
    assert_eq!(profile.provider_bundle, "proxycore.tunnel");
    assert_eq!(profile.server_address, "127.0.0.1");
    assert!(profile.enabled);

    h.controller.start(&session_config()).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Running);
}

#[tokio::test]
async fn test_prepare_keeps_existing_profile() {
    let h = harness().await;

    h.controller.prepare().await.unwrap();

    assert_eq!(h.provider.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_state_watch_follows_transitions() {
    let h = harness().await;
    let mut states = h.controller.subscribe_state();
    assert_eq!(*states.borrow_and_update(), SessionState::Idle);

    h.controller.start(&session_config()).await.unwrap();

    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SessionState::Running);
}

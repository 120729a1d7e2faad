//! HttpConnectivityMonitor against a mock endpoint

use std::sync::Arc;
use std::time::Duration;

use tidemark_core::ports::{ConnectivityMonitor, NoopBackgroundChannel};
use tidemark_core::testing::ScriptedExecutor;
use tidemark_core::{EngineContext, MemoryStorage, OfflineEngine};
use tidemark_domain::{ConnectionQuality, EngineConfig, EventKind};
use tidemark_infra::{HttpConnectivityMonitor, ProbeConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn probe_config(server: &MockServer) -> ProbeConfig {
    ProbeConfig {
        url: Some(format!("{}/health", server.uri())),
        timeout: Duration::from_millis(500),
        excellent_below: Duration::from_millis(100),
        good_below: Duration::from_millis(200),
    }
}

async fn respond(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("GET")).and(path("/health")).respond_with(template).mount(server).await;
}

#[tokio::test]
async fn fast_answer_is_excellent() {
    let server = MockServer::start().await;
    respond(&server, ResponseTemplate::new(200)).await;

    let monitor = HttpConnectivityMonitor::new(&probe_config(&server)).unwrap();
    let status = monitor.probe().await;

    assert!(status.reachable);
    assert_eq!(status.quality, ConnectionQuality::Excellent);
    assert!(status.latency_ms.is_some());
    assert_eq!(monitor.current(), status);
}

#[tokio::test]
async fn slow_answer_is_poor() {
    let server = MockServer::start().await;
    respond(&server, ResponseTemplate::new(204).set_delay(Duration::from_millis(250))).await;

    let monitor = HttpConnectivityMonitor::new(&probe_config(&server)).unwrap();
    let status = monitor.probe().await;

    assert!(status.reachable);
    assert_eq!(status.quality, ConnectionQuality::Poor);
    assert!(status.latency_ms.unwrap_or_default() >= 250);
}

#[tokio::test]
async fn server_error_is_reachable_but_poor() {
    let server = MockServer::start().await;
    respond(&server, ResponseTemplate::new(503)).await;

    let monitor = HttpConnectivityMonitor::new(&probe_config(&server)).unwrap();
    let status = monitor.probe().await;

    assert!(status.reachable);
    assert_eq!(status.quality, ConnectionQuality::Poor);
}

#[tokio::test]
async fn timeout_reports_offline() {
    let server = MockServer::start().await;
    respond(&server, ResponseTemplate::new(200).set_delay(Duration::from_secs(2))).await;

    let monitor = HttpConnectivityMonitor::new(&probe_config(&server)).unwrap();
    let mut changes = monitor.subscribe();
    let status = monitor.probe().await;

    assert!(!status.reachable);
    assert_eq!(status.quality, ConnectionQuality::Offline);
    changes.changed().await.unwrap();
    assert!(!changes.borrow().reachable);
}

#[tokio::test]
async fn refused_connection_reports_offline() {
    let config = {
        let server = MockServer::start().await;
        probe_config(&server)
    };

    let monitor = HttpConnectivityMonitor::new(&config).unwrap();
    assert!(!monitor.probe().await.reachable);
}

#[tokio::test]
async fn engine_follows_probe_results() {
    let server = MockServer::start().await;
    respond(&server, ResponseTemplate::new(200)).await;

    let (ctx, _scheduler) = EngineContext::manual(1_700_000_000_000);
    let monitor = Arc::new(HttpConnectivityMonitor::new(&probe_config(&server)).unwrap());
    let engine = OfflineEngine::new(
        EngineConfig::default(),
        ctx,
        Arc::new(MemoryStorage::new()),
        Arc::new(ScriptedExecutor::succeeding()),
        monitor,
        Arc::new(NoopBackgroundChannel),
    );
    engine.initialize().await.unwrap();

    let status = engine.check_connectivity().await.expect("probe ran");
    assert!(status.reachable);
    assert!(engine.get_state().is_online);

    server.reset().await;
    respond(&server, ResponseTemplate::new(200).set_delay(Duration::from_secs(2))).await;

    let status = engine.check_connectivity().await.expect("probe ran");
    assert!(!status.reachable);
    assert!(!engine.get_state().is_online);
    let offline_events = engine
        .context()
        .events
        .history()
        .iter()
        .filter(|record| record.event.kind() == EventKind::OfflineDetected)
        .count();
    assert_eq!(offline_events, 1);

    engine.destroy().await.unwrap();
}

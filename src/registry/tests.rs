use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::*;
use crate::config::ActiveConfig;
use crate::handler::SourceHandler;
use crate::protocol::Envelope;
use crate::session::socket::fake::{FakeBehavior, FakeDialer};
use crate::session::{SessionSender, SessionSettings, SocketDialer};
use crate::settings::ConnectorSettings;

struct NullHandler;

#[async_trait]
impl SourceHandler for NullHandler {
    fn name(&self) -> &str {
        "null"
    }

    async fn on_configure(
        &self,
        _session: SessionSender,
        _config: &ActiveConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_publish(&self, _envelope: Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_query(&self, _envelope: Envelope) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

fn make_core(source: &str, behavior: FakeBehavior) -> (ConnectorCore, Arc<FakeDialer>) {
    let dialer = FakeDialer::new(behavior);
    let core = ConnectorCore::with_dialer(
        SessionSettings::new("ws://platform.test/link", "token-1", source),
        Arc::clone(&dialer) as Arc<dyn SocketDialer>,
        Arc::new(NullHandler),
        &ConnectorSettings::default(),
    );
    (core, dialer)
}

#[test]
fn register_and_get_round_trip() {
    let registry = ConnectorRegistry::new();
    let (core, _dialer) = make_core("sensor-a", FakeBehavior::accept());

    let handle = registry.register(core).unwrap();
    assert_eq!(handle.source_name(), "sensor-a");
    assert_eq!(registry.count(), 1);
    assert!(registry.get("sensor-a").is_some());
    assert!(registry.get("sensor-b").is_none());
}

#[test]
fn duplicate_source_is_refused() {
    let registry = ConnectorRegistry::new();
    let (first, _d1) = make_core("sensor-a", FakeBehavior::accept());
    let (second, _d2) = make_core("sensor-a", FakeBehavior::accept());

    registry.register(first).unwrap();
    let err = registry.register(second).unwrap_err();
    assert_eq!(err, RegistryError::DuplicateSource("sensor-a".to_string()));
    assert_eq!(registry.count(), 1);
}

#[test]
fn empty_source_name_is_refused() {
    let registry = ConnectorRegistry::new();
    let (core, _dialer) = make_core("", FakeBehavior::accept());
    assert_eq!(
        registry.register(core).unwrap_err(),
        RegistryError::EmptySourceName
    );
    assert!(registry.is_empty());
}

#[test]
fn source_names_come_back_sorted() {
    let registry = ConnectorRegistry::new();
    for source in ["zeta", "alpha", "mid"] {
        let (core, _dialer) = make_core(source, FakeBehavior::accept());
        registry.register(core).unwrap();
    }
    assert_eq!(registry.source_names(), vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn start_all_counts_only_the_sources_that_came_up() {
    let registry = ConnectorRegistry::new();
    let (good, _d1) = make_core("sensor-a", FakeBehavior::accept());
    let (bad, _d2) = make_core("sensor-b", FakeBehavior::reject_auth("bad token"));
    registry.register(good).unwrap();
    registry.register(bad).unwrap();

    let started = registry.start_all(Duration::from_secs(1)).await;
    assert_eq!(started, 1);
    assert!(registry.get("sensor-a").unwrap().is_healthy());
    assert!(!registry.get("sensor-b").unwrap().is_healthy());
    assert!(!registry.all_healthy());

    registry.stop_all().await;
}

#[tokio::test]
async fn all_healthy_requires_at_least_one_source() {
    let registry = ConnectorRegistry::new();
    assert!(!registry.all_healthy());

    let (core, _dialer) = make_core("sensor-a", FakeBehavior::accept());
    registry.register(core).unwrap();
    assert!(!registry.all_healthy());

    registry.start_all(Duration::from_secs(1)).await;
    assert!(registry.all_healthy());

    registry.stop_all().await;
    assert!(!registry.all_healthy());
}

#[tokio::test]
async fn stop_all_closes_every_socket() {
    let registry = ConnectorRegistry::new();
    let (core_a, dialer_a) = make_core("sensor-a", FakeBehavior::accept());
    let (core_b, dialer_b) = make_core("sensor-b", FakeBehavior::accept());
    registry.register(core_a).unwrap();
    registry.register(core_b).unwrap();

    assert_eq!(registry.start_all(Duration::from_secs(1)).await, 2);
    registry.stop_all().await;

    assert!(dialer_a.last_wire().unwrap().is_closed());
    assert!(dialer_b.last_wire().unwrap().is_closed());
}

#[tokio::test]
async fn statuses_are_sorted_and_complete() {
    let registry = ConnectorRegistry::new();
    for source in ["beta", "alpha"] {
        let (core, _dialer) = make_core(source, FakeBehavior::accept());
        registry.register(core).unwrap();
    }
    registry.start_all(Duration::from_secs(1)).await;

    let statuses = registry.statuses();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].source, "alpha");
    assert_eq!(statuses[1].source, "beta");
    assert!(statuses.iter().all(|status| status.healthy));

    registry.stop_all().await;
}

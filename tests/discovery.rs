//! Discovery between registries sharing an in-process bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pubsub_rpc::{
    LocalBus, LocalNode, MethodRouter, Operator, QueryEvent, QueryListener, QueryStream, Rule,
    ServiceDescription, ServiceFilter, ServiceHandle, ServiceRegistry,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

async fn registry(bus: &LocalBus) -> anyhow::Result<(ServiceRegistry, Arc<LocalNode>)> {
    let node = bus.node();
    let registry = ServiceRegistry::builder()
        .node(node.clone())
        .find_timeout(Duration::from_secs(2))
        .build()
        .await?;
    Ok((registry, node))
}

fn echo_service() -> ServiceHandle {
    ServiceHandle::new(MethodRouter::new("Echo"))
}

async fn next_event(stream: &mut QueryStream) -> QueryEvent {
    timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("query event in time")
        .expect("query stream open")
}

async fn assert_quiet(stream: &mut QueryStream) {
    if let Ok(event) = timeout(Duration::from_millis(200), stream.recv()).await {
        panic!("unexpected query event: {event:?}");
    }
}

#[test_log::test(tokio::test)]
async fn find_returns_the_remote_service() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let svc = echo_service();
    let advertised = a
        .add_service(&svc, ServiceDescription::with_properties([("host", "a")]))
        .await?;
    info!(channel = %advertised.channel(), "advertised");

    let found = b
        .find(&ServiceFilter::new("Echo"))
        .await
        .expect("Echo is hosted by a");
    assert_eq!(found.channel(), svc.channel());
    assert_eq!(found.property("host"), Some("a"));
    assert_eq!(found, advertised);

    let missing = b
        .find_with_timeout(&ServiceFilter::new("Other"), Duration::from_millis(200))
        .await;
    assert!(missing.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn find_applies_rules_remotely() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let bad = echo_service();
    let good = echo_service();
    a.add_service(&bad, ServiceDescription::with_properties([("host", "bad-host")]))
        .await?;
    a.add_service(&good, ServiceDescription::with_properties([("host", "good-host")]))
        .await?;

    let filter = ServiceFilter::new("Echo")
        .with_rule(Rule::new("host", "bad-host", Operator::Equals).negated());
    let found = b.find(&filter).await.expect("a service other than bad-host");
    assert_eq!(found.channel(), good.channel());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn find_all_collects_every_provider() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (c, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let on_a = echo_service();
    let on_c = echo_service();
    a.add_service(&on_a, ServiceDescription::default()).await?;
    c.add_service(&on_c, ServiceDescription::default()).await?;

    let found = b
        .find_all(&ServiceFilter::new("Echo"), Duration::from_millis(300))
        .await;
    let mut channels: Vec<&str> = found.iter().map(|d| d.channel()).collect();
    channels.sort_unstable();
    let mut expected = vec![on_a.channel(), on_c.channel()];
    expected.sort_unstable();
    assert_eq!(channels, expected);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn query_started_before_registration() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let filter = ServiceFilter::new("Echo");
    let mut events = b.start_query_stream(&filter).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let svc = echo_service();
    a.add_service(&svc, ServiceDescription::default()).await?;
    match next_event(&mut events).await {
        QueryEvent::Added(desc) => assert_eq!(desc.channel(), svc.channel()),
        other => panic!("expected added, got {other:?}"),
    }
    assert_quiet(&mut events).await;

    a.remove_service(&svc).await?;
    match next_event(&mut events).await {
        QueryEvent::Removed(desc) => assert_eq!(desc.channel(), svc.channel()),
        other => panic!("expected removed, got {other:?}"),
    }

    assert!(b.stop_query(events.filter()).await);
    a.add_service(&svc, ServiceDescription::default()).await?;
    assert_quiet(&mut events).await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn query_reaches_registries_that_join_later() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (b, _) = registry(&bus).await?;
    let filter = ServiceFilter::new("Echo");
    let mut events = b.start_query_stream(&filter).await;

    let (a, _) = registry(&bus).await?;
    let svc = echo_service();
    a.add_service(&svc, ServiceDescription::default()).await?;

    assert!(matches!(next_event(&mut events).await, QueryEvent::Added(_)));
    assert_quiet(&mut events).await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn numeric_rules_select_continuous_results() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let filter = ServiceFilter::new("Echo")
        .with_rule(Rule::new("someNumber", "10", Operator::Greater).with_pattern(r"(\d+)"));
    let mut events = b.start_query_stream(&filter).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let small = echo_service();
    let large = echo_service();
    a.add_service(&small, ServiceDescription::with_properties([("someNumber", "5")]))
        .await?;
    a.add_service(&large, ServiceDescription::with_properties([("someNumber", "15")]))
        .await?;

    match next_event(&mut events).await {
        QueryEvent::Added(desc) => {
            assert_eq!(desc.channel(), large.channel());
            assert_eq!(desc.property("someNumber"), Some("15"));
        }
        other => panic!("expected added, got {other:?}"),
    }
    assert_quiet(&mut events).await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn departing_peer_removes_its_services() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, a_node) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let mut events = b.start_query_stream(&ServiceFilter::new("Echo")).await;
    let svc = echo_service();
    a.add_service(&svc, ServiceDescription::default()).await?;
    assert!(matches!(next_event(&mut events).await, QueryEvent::Added(_)));

    a_node.disconnect();
    match next_event(&mut events).await {
        QueryEvent::Removed(desc) => assert_eq!(desc.channel(), svc.channel()),
        other => panic!("expected removed, got {other:?}"),
    }
    assert_quiet(&mut events).await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn property_updates_reach_queries() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let filter = ServiceFilter::new("Echo")
        .with_rule(Rule::new("load", "50", Operator::Less));
    let mut events = b.start_query_stream(&filter).await;
    let svc = echo_service();
    a.add_service(&svc, ServiceDescription::with_properties([("load", "10")]))
        .await?;
    assert!(matches!(next_event(&mut events).await, QueryEvent::Added(_)));

    assert!(a.update_service(&svc, [("load", "20")]).await);
    match next_event(&mut events).await {
        QueryEvent::Changed(desc) => assert_eq!(desc.property("load"), Some("20")),
        other => panic!("expected changed, got {other:?}"),
    }

    assert!(a.update_service(&svc, [("load", "90")]).await);
    assert!(matches!(next_event(&mut events).await, QueryEvent::Removed(_)));

    assert!(!a.update_service(&echo_service(), [("load", "1")]).await);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn shutdown_withdraws_everything() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let mut events = b.start_query_stream(&ServiceFilter::new("Echo")).await;
    a.add_service(&echo_service(), ServiceDescription::default())
        .await?;
    assert!(matches!(next_event(&mut events).await, QueryEvent::Added(_)));

    a.shutdown().await?;
    assert!(matches!(next_event(&mut events).await, QueryEvent::Removed(_)));
    assert!(a.nodes().is_empty());
    assert!(b
        .find_with_timeout(&ServiceFilter::new("Echo"), Duration::from_millis(200))
        .await
        .is_none());
    Ok(())
}

/// Looks every added service up again from inside the callback.
struct Refind {
    registry: ServiceRegistry,
    results: mpsc::UnboundedSender<Option<ServiceDescription>>,
}

#[async_trait]
impl QueryListener for Refind {
    async fn added_service(&self, desc: ServiceDescription) {
        let found = self
            .registry
            .find_with_timeout(&ServiceFilter::new(desc.name()), Duration::from_millis(500))
            .await;
        let _ = self.results.send(found);
    }

    async fn removed_service(&self, _desc: ServiceDescription) {}
}

#[test_log::test(tokio::test)]
async fn listeners_may_find_from_their_callbacks() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let (a, _) = registry(&bus).await?;
    let (b, _) = registry(&bus).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Refind {
        registry: b.clone(),
        results: tx,
    };
    b.start_query(&ServiceFilter::new("Echo"), listener).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let svc = echo_service();
    a.add_service(&svc, ServiceDescription::default()).await?;

    let found = timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("listener reported");
    let found = found.expect("find from the callback answered");
    assert_eq!(found.channel(), svc.channel());
    Ok(())
}

//! Consumer servers over the in-memory broker

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{memory_resources, wait_until, RecordingPipeline};
use provbus::broker::MemoryBroker;
use provbus::consumer::{ConsumerState, DeliveryMode};
use provbus::router::{ConsumerServer, ServerConfig, StaticEndpointDirectory, TenantRoutingPipeline};
use provbus::store::MemoryMessageStore;
use provbus::tenant::{StaticTenantDirectory, TenantProfile};
use provbus::types::{names, OutgoingMessage};

const WAIT: Duration = Duration::from_secs(5);

fn notify_profile() -> TenantProfile {
    TenantProfile {
        event_queue: Some("NOTIFY_Q".to_string()),
        api_enabled: false,
        notification_enabled: true,
        service_type: Some("LNP".to_string()),
    }
}

fn event(customer: &str, body: &str) -> OutgoingMessage {
    OutgoingMessage::new(body)
        .with_property(names::CUSTOMER_IDENTIFIER, customer)
        .with_property(names::SUPPLIER, "ACME")
        .with_property(names::TRANSACTION, "PortIn")
        .with_property(names::INTERFACE_VERSION, "2.1")
        .with_property(names::EVENT_CHANNEL_NAME, format!("soa.notify.EventChannel_{}", customer))
}

#[tokio::test]
async fn test_tenant_server_routes_only_its_tenants() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryMessageStore::new());
    let recorder = RecordingPipeline::new();
    let endpoints = StaticEndpointDirectory::new().with_url(
        "100",
        "ACME",
        "PortIn",
        "2.1",
        "https://tenant-100.example.net/callback",
    );
    let pipeline = TenantRoutingPipeline::new(recorder.clone())
        .with_endpoints(Arc::new(endpoints))
        .with_message_store_table("notify_store");

    let directory = StaticTenantDirectory::new()
        .with_tenant("100", notify_profile())
        .with_tenant("200", notify_profile());
    let config = ServerConfig {
        name: "notify".to_string(),
        client_ack: true,
        service_type: Some("LNP".to_string()),
        ..Default::default()
    };

    let server = ConsumerServer::for_tenants(
        config,
        memory_resources(&broker, &store, Arc::new(pipeline)),
        &directory,
    )
    .await
    .unwrap();
    assert_eq!(server.len(), 1);
    assert_eq!(
        server.consumer("NOTIFY_Q").unwrap().selector(),
        Some("CustomerIdentifier IN ('100','200')")
    );

    server.start().await.unwrap();
    broker.enqueue("NOTIFY_Q", event("100", "first"));
    broker.enqueue("NOTIFY_Q", event("300", "foreign"));
    broker.enqueue("NOTIFY_Q", event("200", "second"));

    assert!(wait_until(WAIT, || recorder.count() == 2).await);
    server.shutdown().await;

    assert_eq!(broker.queued_bodies("NOTIFY_Q"), vec!["foreign"]);
    assert_eq!(store.len(), 2);

    let mut processed = recorder.processed();
    processed.sort_by(|a, b| a.body.cmp(&b.body));
    let first = &processed[0].ctx;
    assert_eq!(first.customer_id.as_deref(), Some("100"));
    assert_eq!(first.supplier.as_deref(), Some("ACME"));
    assert_eq!(first.channel_name_base.as_deref(), Some("soa.notify.EventChannel"));
    assert_eq!(first.message_store_table.as_deref(), Some("notify_store"));
    assert_eq!(
        first.get("soa_notify_EventChannel"),
        Some("https://tenant-100.example.net/callback")
    );

    let second = &processed[1].ctx;
    assert_eq!(second.customer_id.as_deref(), Some("200"));
    assert_eq!(second.get("soa_notify_EventChannel"), None);
}

#[tokio::test]
async fn test_added_tenant_is_consumed_after_rebuild() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryMessageStore::new());
    let recorder = RecordingPipeline::new();
    let directory = StaticTenantDirectory::new().with_tenant("100", notify_profile());
    let config = ServerConfig {
        tenants: vec!["100".to_string()],
        ..Default::default()
    };

    let mut server = ConsumerServer::for_tenants(
        config,
        memory_resources(&broker, &store, recorder.clone()),
        &directory,
    )
    .await
    .unwrap();
    server.start().await.unwrap();

    broker.enqueue("NOTIFY_Q", event("200", "late"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 0);

    assert!(server.add_tenant("NOTIFY_Q", "200").await.unwrap());
    assert!(!server.add_tenant("NOTIFY_Q", "200").await.unwrap());
    assert!(wait_until(WAIT, || recorder.count() == 1).await);
    assert_eq!(recorder.processed()[0].body, "late");

    server.shutdown().await;
    assert_eq!(broker.acquired_count(), broker.released_count());
}

#[tokio::test]
async fn test_poll_server_drains_on_timer() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryMessageStore::new());
    let recorder = RecordingPipeline::new();
    let config = ServerConfig {
        delivery_mode: DeliveryMode::Poll,
        client_ack: true,
        poll_interval: Duration::from_millis(20),
        queues: vec!["LSR_EVENTS".to_string()],
        ..Default::default()
    };

    let server = ConsumerServer::for_queues(config, memory_resources(&broker, &store, recorder.clone()))
        .unwrap();
    server.start().await.unwrap();

    for body in ["a", "b", "c"] {
        broker.enqueue("LSR_EVENTS", OutgoingMessage::new(body));
    }
    assert!(wait_until(WAIT, || recorder.count() == 3).await);

    server.shutdown().await;
    assert_eq!(
        server.consumer("LSR_EVENTS").unwrap().state(),
        ConsumerState::Disconnected
    );
    assert_eq!(store.len(), 3);
    assert!(wait_until(WAIT, || broker.acquired_count() == broker.released_count()).await);
}

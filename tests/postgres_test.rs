mod common;

use std::sync::Arc;

use common::{pg_resource_pool, RecordingPipeline};
use provbus::broker::{Broker, BrokerSession, MessageReceiver, PgBroker, PgBrokerConfig, SessionMode};
use provbus::consumer::{AckMode, Consumer, ConsumerConfig, ConsumerResources, DeliveryMode};
use provbus::context::RequestContext;
use provbus::db::{PgResourcePool, PoolKey, ResourcePool, UnitOfWork};
use provbus::producer::{ProduceRequest, Producer, ProducerConfig, SendOutcome};
use provbus::store::{MessageStore, PgMessageStore, StoreOutcome};
use provbus::types::{
    names, MessageEnvelope, MessageProperties, MessageStoreRecord, OutgoingMessage,
    UNAVAILABLE_MESSAGE_ID,
};
use testcontainers::clients::Cli;

async fn install(pools: &PgResourcePool, schema: &str) -> (PgBroker, PgMessageStore) {
    let broker = PgBroker::new(PgBrokerConfig::default().with_schema_name(schema)).unwrap();
    let store = PgMessageStore::new(
        pools.pool(&PoolKey::Default).unwrap().clone(),
        schema,
        "jms_msg_store",
    )
    .unwrap();

    let connection = pools.acquire(&PoolKey::Default).await.unwrap();
    broker.install_schema(&connection).await.unwrap();
    pools.release(&PoolKey::Default, connection).await;
    store.install_schema().await.unwrap();
    (broker, store)
}

async fn queue_depth(broker: &PgBroker, pools: &PgResourcePool, queue: &str) -> u64 {
    let connection = pools.acquire(&PoolKey::Default).await.unwrap();
    let session = broker
        .open_session(&connection, SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let depth = session.browse_count(queue, None).await.unwrap();
    session.close().await.unwrap();
    depth
}

fn producer(broker: &PgBroker, pools: &PgResourcePool, config: ProducerConfig) -> Producer<PgBroker> {
    Producer::new(config, broker.clone(), Arc::new(pools.clone())).unwrap()
}

#[tokio::test]
async fn test_client_ack_recover_returns_row() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let pools = pg_resource_pool(container.get_host_port_ipv4(common::POSTGRES_PORT), "bus_recover");
    let (broker, _store) = install(&pools, "bus_recover").await;

    let connection = pools.acquire(&PoolKey::Default).await.unwrap();
    let session = broker
        .open_session(&connection, SessionMode::ClientAcknowledge)
        .await
        .unwrap();
    session
        .send("SOA_EVENTS", OutgoingMessage::new("<order/>"))
        .await
        .unwrap();

    let receiver = session.create_receiver("SOA_EVENTS", None).await.unwrap();
    let first = receiver.receive_no_wait().await.unwrap().unwrap();
    assert!(!first.redelivered);

    session.recover().await.unwrap();
    let again = receiver.receive_no_wait().await.unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(again.message_id, first.message_id);

    session.acknowledge(&again).await.unwrap();
    session.close().await.unwrap();
    assert_eq!(queue_depth(&broker, &pools, "SOA_EVENTS").await, 0);
}

#[tokio::test]
async fn test_store_insert_is_idempotent_per_broker_id() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let pools = pg_resource_pool(container.get_host_port_ipv4(common::POSTGRES_PORT), "bus_store");
    let (_broker, store) = install(&pools, "bus_store").await;

    let envelope = MessageEnvelope {
        message_id: "ID:1".to_string(),
        header: MessageProperties::new().with(names::CUSTOMER_IDENTIFIER, "100"),
        body: "<order/>".to_string(),
    };
    let record = MessageStoreRecord::new(&envelope, "SOA_EVENTS", "soa").with_tenant_id("100");
    assert_eq!(store.insert(&record).await.unwrap(), StoreOutcome::Stored);
    let duplicate = MessageStoreRecord::new(&envelope, "SOA_EVENTS", "soa");
    assert_eq!(store.insert(&duplicate).await.unwrap(), StoreOutcome::Duplicate);
    assert!(store.contains("ID:1").await.unwrap());
    assert!(!store.contains("ID:2").await.unwrap());

    let unavailable = MessageEnvelope {
        message_id: UNAVAILABLE_MESSAGE_ID.to_string(),
        ..envelope.clone()
    };
    for _ in 0..2 {
        let record = MessageStoreRecord::new(&unavailable, "SOA_EVENTS", "soa");
        assert_eq!(store.insert(&record).await.unwrap(), StoreOutcome::Stored);
    }
    assert!(!store.contains(UNAVAILABLE_MESSAGE_ID).await.unwrap());

    assert_eq!(store.count().await.unwrap(), 3);
    let fetched = store.fetch("ID:1").await.unwrap().unwrap();
    assert_eq!(fetched.tenant_id.as_deref(), Some("100"));
    assert_eq!(fetched.header.get(names::CUSTOMER_IDENTIFIER), Some("100"));
}

#[tokio::test]
async fn test_poll_consumer_stores_before_acknowledging() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let pools = pg_resource_pool(container.get_host_port_ipv4(common::POSTGRES_PORT), "bus_poll");
    let (broker, store) = install(&pools, "bus_poll").await;
    let store = Arc::new(store);

    let sender = producer(&broker, &pools, ProducerConfig::for_queue("SOA_EVENTS"));
    let ctx = RequestContext::for_message("ID:req-1", "INBOUND").with_customer_id("100");
    let SendOutcome::Sent { message_id, .. } = sender
        .send(ProduceRequest::new(&ctx, "<activate/>"))
        .await
        .unwrap()
    else {
        panic!("message was not sent");
    };

    let pipeline = RecordingPipeline::new();
    let resources = ConsumerResources::new(
        broker.clone(),
        Arc::new(pools.clone()),
        Arc::clone(&store) as Arc<dyn MessageStore>,
        pipeline.clone(),
    );
    let consumer = Consumer::new(
        ConsumerConfig::new("SOA_EVENTS", "soa-poller")
            .with_delivery_mode(DeliveryMode::Poll)
            .with_ack_mode(AckMode::Client)
            .with_selector("CustomerIdentifier IN ('100')"),
        resources,
    )
    .unwrap();

    assert_eq!(consumer.poll_once().await.unwrap(), 1);

    let record = store.fetch(&message_id).await.unwrap().unwrap();
    assert_eq!(record.tenant_id.as_deref(), Some("100"));
    assert_eq!(record.body, "<activate/>");
    assert_eq!(queue_depth(&broker, &pools, "SOA_EVENTS").await, 0);

    let processed = pipeline.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].ctx.message_id, message_id);
    assert_eq!(processed[0].ctx.message_store_table.as_deref(), Some("jms_msg_store"));
}

#[tokio::test]
async fn test_transactional_send_follows_unit_of_work() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let pools = pg_resource_pool(container.get_host_port_ipv4(common::POSTGRES_PORT), "bus_txn");
    let (broker, _store) = install(&pools, "bus_txn").await;

    let sender = producer(
        &broker,
        &pools,
        ProducerConfig::for_queue("OUT_EVENTS").transactional(),
    );
    let ctx = RequestContext::for_message("ID:req-2", "INBOUND").with_customer_id("100");

    let committed = UnitOfWork::begin(&pools, &PoolKey::Default).await.unwrap();
    let committed_conn = committed.connection().unwrap().clone();
    let discarded = UnitOfWork::begin(&pools, &PoolKey::Default).await.unwrap();
    let discarded_conn = discarded.connection().unwrap().clone();

    sender
        .send(ProduceRequest::new(&ctx, "committed").with_transaction(&committed_conn))
        .await
        .unwrap();
    sender
        .send(ProduceRequest::new(&ctx, "discarded").with_transaction(&discarded_conn))
        .await
        .unwrap();
    assert_eq!(queue_depth(&broker, &pools, "OUT_EVENTS").await, 0);
    assert_eq!(sender.deferred_count(), 2);

    committed.commit().await.unwrap();
    sender.cleanup(&committed_conn).await;
    assert_eq!(queue_depth(&broker, &pools, "OUT_EVENTS").await, 1);
    assert_eq!(sender.deferred_count(), 1);

    discarded.rollback().await.unwrap();
    sender.cleanup(&discarded_conn).await;
    assert_eq!(queue_depth(&broker, &pools, "OUT_EVENTS").await, 1);
    assert_eq!(sender.deferred_count(), 0);
}

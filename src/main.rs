use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use provbus::broker::{PgBroker, PgBrokerConfig};
use provbus::consumer::ConsumerResources;
use provbus::db::{PoolKey, ResourcePool};
use provbus::logging::init_tracing;
use provbus::pipeline::pipeline_fn;
use provbus::router::{ConsumerServer, TenantRoutingPipeline};
use provbus::settings::Settings;
use provbus::store::PgMessageStore;

#[tokio::main]
async fn main() -> provbus::Result<()> {
    init_tracing();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PROVBUS_CONFIG").ok())
        .map(PathBuf::from);
    let settings = Settings::load(path.as_deref())?;

    let pools = settings.database.build_resource_pool()?;
    let broker = PgBroker::new(PgBrokerConfig::default().with_schema_name(settings.database.schema_name.clone()))?;
    let store = PgMessageStore::new(
        pools.pool(&PoolKey::Default)?.clone(),
        settings.database.schema_name.clone(),
        settings.server.message_store_table.clone(),
    )?;

    let connection = pools.acquire(&PoolKey::Default).await?;
    broker.install_schema(&connection).await?;
    pools.release(&PoolKey::Default, connection).await;
    store.install_schema().await?;

    let pipeline = TenantRoutingPipeline::new(pipeline_fn(|ctx, _header, body| async move {
        info!(
            message_id = %ctx.message_id,
            queue = ?ctx.queue_name,
            customer = ?ctx.customer_id,
            bytes = body.len(),
            "Message received"
        );
        Ok(())
    }))
    .with_message_store_table(settings.server.message_store_table.clone());

    let resources = ConsumerResources::new(
        broker,
        Arc::new(pools),
        Arc::new(store),
        Arc::new(pipeline),
    );

    let mut server = ConsumerServer::for_queues(settings.server.clone(), resources)?;
    for consumer in settings.consumer_configs() {
        server.add_consumer(consumer)?;
    }
    if server.is_empty() {
        warn!("No consumers configured");
    }
    server.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Unable to listen for shutdown signal");
    }
    server.shutdown().await;
    Ok(())
}

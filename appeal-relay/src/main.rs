use std::sync::Arc;
use std::time::Duration;

use appeal_relay::config::Config;
use appeal_relay::consumer::{KafkaInboundSource, RelayConsumer};
use appeal_relay::health::HealthRegistry;
use appeal_relay::inbox::InboxWatcher;
use appeal_relay::pipeline::Pipeline;
use appeal_relay::publish::{KafkaRelaySink, RelayPublisher};
use appeal_relay::server::{router, serve, setup_metrics_recorder, setup_metrics_routes, AppState};
use appeal_relay::store::{MessageStore, PgMessageStore};
use appeal_relay::worker::UploadQueue;
use common_kafka::admin::{ensure_topic, KafkaTopicAdmin};
use common_kafka::kafka_consumer::ManualCommitConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const CONSUMER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

fn setup_tracing() -> Result<(), anyhow::Error> {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("rdkafka=warn".parse()?);

    // Only one of the two formatters is ever installed
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!json).then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
    Ok(())
}

async fn shutdown_signal() -> Result<(), std::io::Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("Starting appeal relay...");

    let config = Config::init_from_env()?;
    info!(
        topic_out = config.kafka_topic_out,
        topic_in = config.topic_in(),
        dead_letter_topic = ?config.kafka_dead_letter_topic,
        upload_dir = %config.upload_dir.display(),
        "Configuration loaded"
    );

    let recorder = setup_metrics_recorder()?;

    let store = PgMessageStore::connect(&config.database_url, config.max_pg_connections).await?;
    store.migrate().await?;
    let store: Arc<dyn MessageStore> = Arc::new(store);

    let admin = KafkaTopicAdmin::new(&config.kafka, ADMIN_TIMEOUT)?;
    for topic in config.topics() {
        ensure_topic(
            &admin,
            &topic,
            config.kafka_topic_partitions,
            config.kafka_topic_replication,
        )
        .await?;
    }

    let producer = create_kafka_producer(&config.kafka).await?;
    let sink = Arc::new(KafkaRelaySink::new(producer, config.publish_timeout()));
    let publisher = RelayPublisher::new(sink.clone(), config.retry_policy());

    let liveness = HealthRegistry::new("liveness");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Relay consumer
    let kafka_consumer = ManualCommitConsumer::new(
        &config.kafka,
        &config.consumer,
        &[config.topic_in().to_string()],
    )?;
    let relay = RelayConsumer::new(
        Arc::new(KafkaInboundSource::new(kafka_consumer, SEEK_TIMEOUT)),
        store.clone(),
        config
            .kafka_dead_letter_topic
            .is_some()
            .then(|| publisher.clone()),
        config.consumer_settings(),
    );
    let consumer_task = {
        let handle = liveness.register("relay_consumer", CONSUMER_LIVENESS_DEADLINE);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { relay.run(shutdown, handle).await })
    };

    // File uploads
    let pipeline = Pipeline::new(publisher, store.clone(), config.pipeline_settings());
    let queue = Arc::new(UploadQueue::new(
        pipeline,
        config.upload_workers,
        config.upload_queue_capacity,
    ));
    queue.start();

    let poll_interval = Duration::from_secs(config.upload_poll_seconds);
    let watcher = InboxWatcher::new(config.upload_dir.clone(), queue.clone(), poll_interval);
    let watcher_task = {
        let deadline = poll_interval * 3 + CONSUMER_LIVENESS_DEADLINE;
        let handle = liveness.register("inbox_watcher", deadline);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { watcher.run(shutdown, handle).await })
    };

    // Health and metrics server
    let bind = config.bind_address();
    let http_router = setup_metrics_routes(router(AppState { liveness, store }), recorder);
    tokio::spawn(async move {
        if let Err(e) = serve(http_router, &bind).await {
            error!(bind, "http server failed: {}", e);
        }
    });

    shutdown_signal().await?;
    info!("Shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        warn!("no task left to receive the shutdown signal");
    }

    watcher_task.await?;
    queue.shutdown().await;
    consumer_task.await?;
    tokio::task::spawn_blocking(move || sink.flush()).await?;

    info!("Appeal relay shut down");
    Ok(())
}

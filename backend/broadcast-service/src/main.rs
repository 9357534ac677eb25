use actix_web::{middleware, web, App, HttpServer};
use broadcast_service::{
    config::Config,
    handlers::{
        broadcasts::register_routes as register_broadcasts,
        connections::register_routes as register_connections,
        dlt::register_routes as register_dlt, stream::register_routes as register_stream,
    },
    metrics,
    presence::PresenceStore,
    repository::{
        BroadcastRepository, DltRepository, PreferencesRepository, SessionRepository,
        StatisticsRepository, UserBroadcastRepository,
    },
    services::{
        daily_with_lease, every_with_lease, BroadcastService, DeliveryService, Dispatcher,
        DispatcherContext, DltService, HttpUserDirectory, LifecycleController, ResilientDirectory,
        TargetingService,
    },
    sse::{ConnectionManager, ConnectionRegistry},
};
use governor::{Quota, RateLimiter};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use redis_utils::{DistributedLease, RedisPool};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use transactional_outbox::{metrics::OutboxMetrics, KafkaOutboxPublisher, OutboxProcessor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().map_err(|e| io::Error::other(e.to_string()))?;
    tracing::info!(pod_id = %config.app.pod_id, "Starting broadcast service");

    // Database
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            io::Error::other("database connection failed")
        })?;
    tracing::info!("Connected to database");

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!("Migrations failed: {}", e);
        return Err(io::Error::other("migrations failed"));
    }

    // Redis: presence, pending-event cache and the lifecycle leases
    let redis = RedisPool::connect(&config.redis.url).await.map_err(|e| {
        tracing::error!("Failed to connect to Redis: {}", e);
        io::Error::other("redis connection failed")
    })?;
    let presence = PresenceStore::new(
        &redis,
        Duration::from_millis(config.redis.command_timeout_ms),
        Duration::from_secs(config.redis.presence_ttl_secs),
        Duration::from_secs(config.redis.pending_event_ttl_secs),
    );
    let lease = DistributedLease::new(redis.manager());

    // One idempotent Kafka producer shared by the outbox drain, the DLT
    // routing and the redrive path
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .create()
        .map_err(|e| {
            tracing::error!("Failed to create Kafka producer: {}", e);
            io::Error::other("kafka producer failed")
        })?;

    // Repositories
    let broadcasts_repo = BroadcastRepository::new(pool.clone());
    let user_broadcasts_repo = UserBroadcastRepository::new(pool.clone());
    let statistics_repo = StatisticsRepository::new(pool.clone());
    let sessions_repo = SessionRepository::new(pool.clone());
    let preferences_repo = PreferencesRepository::new(pool.clone());
    let dlt_repo = DltRepository::new(pool.clone());

    // Targeting behind the breaker + bulkhead
    let http_directory = HttpUserDirectory::new(
        config.directory.base_url.clone(),
        Duration::from_millis(config.directory.request_timeout_ms),
    )
    .map_err(|e| io::Error::other(e.to_string()))?;
    let directory = Arc::new(ResilientDirectory::new(
        Arc::new(http_directory),
        config.directory.max_concurrent_calls,
    ));
    let targeting = Arc::new(TargetingService::new(directory, preferences_repo));

    // Local sinks + delivery
    let (registry, dead_sessions) = ConnectionRegistry::new(config.sse.channel_buffer);
    let delivery = Arc::new(DeliveryService::new(
        pool.clone(),
        broadcasts_repo.clone(),
        user_broadcasts_repo.clone(),
        statistics_repo.clone(),
        registry.clone(),
        presence.clone(),
        config.kafka.clone(),
        config.app.pod_id.clone(),
    ));

    let connections = Arc::new(ConnectionManager::new(
        config.app.pod_id.clone(),
        registry.clone(),
        sessions_repo.clone(),
        presence.clone(),
        delivery.clone(),
    ));
    connections.spawn_close_reaper(dead_sessions);

    let broadcast_service = Arc::new(BroadcastService::new(
        pool.clone(),
        broadcasts_repo,
        user_broadcasts_repo,
        statistics_repo,
        targeting.clone(),
        presence.clone(),
        config.kafka.clone(),
        config.app.pod_id.clone(),
    ));

    let dlt_service = Arc::new(DltService::new(
        dlt_repo,
        producer.clone(),
        config.kafka.clone(),
    ));

    let lifecycle = Arc::new(LifecycleController::new(
        pool.clone(),
        sessions_repo,
        targeting,
        connections.clone(),
        config.kafka.clone(),
        config.app.pod_id.clone(),
    ));

    // Everything below runs until the shutdown signal fires
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Outbox drain
    {
        let processor = OutboxProcessor::new(
            pool.clone(),
            Arc::new(KafkaOutboxPublisher::new(producer.clone())),
            config.outbox.batch_size,
            Duration::from_millis(config.outbox.poll_interval_ms),
        )
        .with_metrics(OutboxMetrics::new("broadcast-service"));
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { processor.run(rx).await });
    }

    // Dispatchers, one per core topic
    for topic in [
        config.kafka.topic_selected.clone(),
        config.kafka.topic_group.clone(),
    ] {
        let dispatcher = Dispatcher::new(
            config.kafka.clone(),
            config.app.pod_id.clone(),
            DispatcherContext {
                delivery: delivery.clone(),
                registry: registry.clone(),
                presence: presence.clone(),
            },
            producer.clone(),
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(topic, rx).await });
    }

    // DLT ingest
    {
        let service = dlt_service.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { service.run_ingest(rx).await });
    }

    // Heartbeats
    let heartbeat = Duration::from_millis(config.sse.heartbeat_interval_ms);
    {
        let manager = connections.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { manager.run_push_heartbeat(heartbeat, rx).await });
    }
    {
        let manager = connections.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { manager.run_db_heartbeat(heartbeat, rx).await });
    }

    // Lifecycle jobs, each under its own named lease
    {
        let ctrl = lifecycle.clone();
        let lease = lease.clone();
        let rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.lifecycle.activation_interval_secs);
        tokio::spawn(async move {
            every_with_lease(
                lease,
                "processScheduledBroadcasts",
                Duration::from_secs(2),
                Duration::from_secs(55),
                period,
                rx,
                move || {
                    let ctrl = ctrl.clone();
                    async move { ctrl.activate_due_broadcasts().await.map(|_| ()) }
                },
            )
            .await;
        });
    }
    {
        let ctrl = lifecycle.clone();
        let lease = lease.clone();
        let rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.lifecycle.expiration_interval_secs);
        tokio::spawn(async move {
            every_with_lease(
                lease,
                "processExpiredBroadcasts",
                Duration::from_secs(2),
                Duration::from_secs(55),
                period,
                rx,
                move || {
                    let ctrl = ctrl.clone();
                    async move { ctrl.expire_due_broadcasts().await.map(|_| ()) }
                },
            )
            .await;
        });
    }
    {
        let ctrl = lifecycle.clone();
        let lease = lease.clone();
        let rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.lifecycle.session_cleanup_interval_secs);
        let threshold = Duration::from_millis(config.sse.stale_threshold_ms());
        tokio::spawn(async move {
            every_with_lease(
                lease,
                "cleanupStaleSseSessions",
                Duration::from_secs(2),
                Duration::from_secs(55),
                period,
                rx,
                move || {
                    let ctrl = ctrl.clone();
                    async move { ctrl.cleanup_stale_sessions(threshold).await.map(|_| ()) }
                },
            )
            .await;
        });
    }
    {
        let ctrl = lifecycle.clone();
        let lease = lease.clone();
        let rx = shutdown_rx.clone();
        let retention = config.lifecycle.session_retention_days;
        tokio::spawn(async move {
            daily_with_lease(
                lease,
                "purgeOldInactiveSessions",
                2,
                Duration::from_secs(30),
                Duration::from_secs(600),
                rx,
                move || {
                    let ctrl = ctrl.clone();
                    async move { ctrl.purge_old_sessions(retention).await.map(|_| ()) }
                },
            )
            .await;
        });
    }

    // Admin create guard
    let per_minute = NonZeroU32::new(config.app.create_rate_per_minute.max(1))
        .unwrap_or(NonZeroU32::MIN);
    let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

    let addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Starting HTTP server on {}", addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(broadcast_service.clone()))
            .app_data(web::Data::new(delivery.clone()))
            .app_data(web::Data::new(connections.clone()))
            .app_data(web::Data::new(dlt_service.clone()))
            .app_data(web::Data::new(limiter.clone()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(|cfg| {
                register_broadcasts(cfg);
                register_stream(cfg);
                register_dlt(cfg);
                register_connections(cfg);
            })
    })
    .keep_alive(Duration::from_secs(300))
    .bind(&addr)?
    .run()
    .await;

    let _ = shutdown_tx.send(());
    tracing::info!("Broadcast service stopped");
    server
}

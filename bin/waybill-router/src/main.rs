//! Waybill Production Router
//!
//! Consumes messages from SQS and routes them through the processing pipeline.
//! Provides REST API for monitoring, health, and message publishing.
//!
//! ## Production Features
//!
//! - **Dynamic Configuration Sync**: Periodically fetches configuration from a central
//!   service and hot-reloads without restart.
//!
//! - **Active/Standby HA**: Uses Redis-based leader election for high availability.
//!   Only the leader processes messages. Enable with `WAYBILL_STANDBY_ENABLED=true`.
//!
//! ## Development Mode
//!
//! Set `WAYBILL_DEV_MODE=true` to enable development mode with:
//! - Built-in LocalStack SQS queue configuration
//! - Test endpoints for simulating various response scenarios
//! - Message seeding endpoints

use std::sync::Arc;
use std::time::Duration;
use waybill_router::{
    QueueManager, HttpMediator, LifecycleManager, LifecycleConfig,
    WarningService, WarningServiceConfig,
    HealthService, HealthServiceConfig,
    CircuitBreakerRegistry,
    ConfigSyncService, ConfigSyncConfig,
    StandbyProcessor, StandbyRouterConfig,
    NotificationConfig, create_notification_service_with_scheduler,
    api::create_router,
};
use waybill_common::{RouterConfig, PoolConfig, QueueConfig, WarningSeverity};
use waybill_config::AppConfig;
use waybill_queue::sqs::SqsQueueConsumer;
use anyhow::Result;
use tracing::{info, warn, error};
use tokio::{signal, net::TcpListener};
use tower_http::cors::{AllowOrigin, CorsLayer, Any};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    waybill_common::logging::init_logging("waybill-router");
    waybill_router::router_metrics::install_prometheus_recorder();

    info!("Starting Waybill Message Router (Production)");

    // Load TOML config (if present) with environment variable overrides
    let app_config = AppConfig::load()?;

    // 1. Setup AWS Config
    // In dev mode, configure to use LocalStack endpoint
    let dev_mode = app_config.dev_mode;

    let sqs_client = if dev_mode {
        let endpoint_url = std::env::var("LOCALSTACK_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4566".to_string());
        info!(endpoint = %endpoint_url, "Configuring SQS client for LocalStack");

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&endpoint_url)
            .load()
            .await;
        aws_sdk_sqs::Client::new(&config)
    } else {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        aws_sdk_sqs::Client::new(&config)
    };

    // 2. Initialize Warning and Health Services
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    // 2b. Initialize Notification Service (Teams webhooks)
    let notification_config = load_notification_config();
    let notification_scheduler = create_notification_service_with_scheduler(&notification_config);
    if let Some(ref ns) = notification_scheduler {
        info!(
            batch_interval = notification_config.batch_interval_seconds,
            "Notification service enabled (Teams webhook with batching)"
        );
        // Wire up notification service to warning service
        warning_service.set_notification_service(ns.service.clone());
    } else {
        info!("Notification service disabled - no channels configured");
    }

    // 3. Initialize Mediator (production mode: HTTP/2, 15 minute timeout)
    // Registry is shared with the monitoring API below so /monitoring/circuit-breakers
    // reflects the per-target breakers the mediator actually trips.
    let circuit_breaker_registry = Arc::new(CircuitBreakerRegistry::default());
    let mediator = Arc::new(
        HttpMediator::production().with_circuit_breaker_registry(circuit_breaker_registry.clone()),
    );

    // 4. Create QueueManager
    let queue_manager = Arc::new(QueueManager::new(mediator.clone()));

    // 5. Initialize Standby Processor (Active/Passive HA)
    let standby_config = load_standby_config(&app_config);
    let standby = if standby_config.enabled {
        info!(
            redis_url = %standby_config.redis_url,
            lock_key = %standby_config.lock_key,
            "Initializing standby mode (Active/Passive HA)"
        );
        match StandbyProcessor::new(standby_config).await {
            Ok(processor) => {
                if let Err(e) = processor.start().await {
                    error!(error = %e, "Failed to start standby processor");
                    return Err(anyhow::anyhow!("Standby processor failed to start: {}", e));
                }
                Some(Arc::new(processor))
            }
            Err(e) => {
                error!(error = %e, "Failed to create standby processor");
                return Err(anyhow::anyhow!("Standby processor creation failed: {}", e));
            }
        }
    } else {
        info!("Standby mode disabled - this instance will always be active");
        None
    };

    // 6. Wait for leadership if in standby mode
    if let Some(ref standby_proc) = standby {
        if !standby_proc.is_leader() {
            info!("Waiting to become leader before starting message processing...");
            standby_proc.wait_for_leadership().await;
            info!("Acquired leadership - starting message processing");
        }
    }

    // 7. Initialize Configuration
    // Dev mode uses built-in LocalStack config, production requires config URL
    let (router_config, config_sync) = if dev_mode {
        info!("Development mode enabled - using built-in LocalStack configuration");
        let config = create_dev_config();
        info!(
            queues = config.queues.len(),
            pools = config.processing_pools.len(),
            "Loaded dev configuration"
        );
        (config, None)
    } else {
        // Production mode - fetch config from URL
        let config_url = std::env::var("WAYBILL_CONFIG_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| Some(app_config.router.config_sync.config_url.clone()).filter(|v| !v.is_empty()))
            .ok_or_else(|| anyhow::anyhow!("WAYBILL_CONFIG_URL is required (or set WAYBILL_DEV_MODE=true)"))?;

        let config_sync_config = load_config_sync_config(&app_config, &config_url);

        info!(
            url = %config_sync_config.config_url,
            interval = ?config_sync_config.sync_interval,
            "Initializing configuration sync"
        );
        let sync_service = Arc::new(ConfigSyncService::new(
            config_sync_config,
            queue_manager.clone(),
            warning_service.clone(),
        ));

        // Perform initial sync - router cannot start without configuration
        let config = match sync_service.initial_sync().await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Initial configuration sync failed - cannot start router");
                return Err(anyhow::anyhow!("Initial config sync failed: {}", e));
            }
        };

        (config, Some(sync_service))
    };

    // 8. Create SQS consumers from config
    let mut first_queue_url: Option<String> = None;
    for queue_config in &router_config.queues {
        info!(
            queue_name = %queue_config.name,
            queue_uri = %queue_config.uri,
            connections = queue_config.connections,
            visibility_timeout = queue_config.visibility_timeout,
            "Creating SQS consumer from config"
        );

        let consumer = Arc::new(SqsQueueConsumer::from_queue_url(
            sqs_client.clone(),
            queue_config.uri.clone(),
            queue_config.visibility_timeout as i32,
        ).await);
        queue_manager.add_consumer(consumer).await;

        // Track first queue URL for publisher
        if first_queue_url.is_none() {
            first_queue_url = Some(queue_config.uri.clone());
        }
    }

    if router_config.queues.is_empty() {
        error!("No queues configured - cannot start router");
        return Err(anyhow::anyhow!("No queues configured in config sync response"));
    }

    // 9. Start lifecycle manager with all features
    let lifecycle = LifecycleManager::start_with_features(
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
        config_sync,
        standby.clone(),
    );

    // 10. Setup HTTP API server
    let api_port = app_config.http.port;

    // Create a simple publisher that publishes to the first queue
    let publisher_queue_url = first_queue_url.expect("At least one queue must be configured");
    let publisher = Arc::new(SqsPublisher::new(sqs_client, publisher_queue_url));

    let cors_layer = build_cors_layer(&app_config.http.cors_origins);

    let app = create_router(
        publisher,
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        circuit_breaker_registry,
    )
    .layer(TraceLayer::new_for_http())
    .layer(cors_layer);

    let addr = format!("{}:{}", app_config.http.host, api_port);
    info!(port = api_port, "Starting HTTP API server");

    let listener = TcpListener::bind(&addr).await?;
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // 11. Start QueueManager in background (respecting standby status)
    // Create a shutdown channel for the manager loop
    let (manager_shutdown_tx, mut manager_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let manager_handle = {
        let manager = queue_manager.clone();
        let standby_for_loop = standby.clone();

        tokio::spawn(async move {
            // If we have standby, wait for leadership before processing
            if let Some(ref standby_proc) = standby_for_loop {
                loop {
                    tokio::select! {
                        _ = &mut manager_shutdown_rx => {
                            info!("Manager loop received shutdown signal");
                            break;
                        }
                        _ = async {
                            if standby_proc.should_process() {
                                info!("Leader status confirmed - starting message consumption");
                                if let Err(e) = manager.clone().start().await {
                                    error!("QueueManager error: {}", e);
                                }
                                // If start() returns, check if we lost leadership
                                if !standby_proc.should_process() {
                                    warn!("Lost leadership during processing - pausing");
                                    standby_proc.wait_for_leadership().await;
                                    info!("Re-acquired leadership - resuming");
                                }
                            } else {
                                // Not leader, wait
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        } => {}
                    }
                }
            } else {
                // No standby mode - just run (start() already listens to shutdown_tx)
                if let Err(e) = manager.clone().start().await {
                    error!("QueueManager error: {}", e);
                }
            }
        })
    };

    // Log startup summary
    log_startup_summary(&lifecycle);

    info!("Waybill Router started. Press Ctrl+C to shutdown.");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown
    // Signal the manager loop to exit
    let _ = manager_shutdown_tx.send(());

    lifecycle.shutdown().await;
    queue_manager.shutdown().await;

    server_task.abort();

    // Wait for manager handle with timeout, then abort if still running
    match tokio::time::timeout(std::time::Duration::from_secs(30), manager_handle).await {
        Ok(_) => info!("Manager task completed gracefully"),
        Err(_) => {
            warn!("Manager task did not complete within 30s timeout");
            // The task will be cancelled when the runtime shuts down
        }
    }

    info!("Waybill Router shutdown complete");
    Ok(())
}

/// Build standby configuration from the loaded app config, falling back to the
/// shared Redis URL when no standby-specific one is set.
fn load_standby_config(app_config: &AppConfig) -> StandbyRouterConfig {
    let standby = &app_config.router.standby;

    let redis_url = if standby.redis_url.is_empty() {
        app_config.redis.url.clone()
    } else {
        standby.redis_url.clone()
    };

    let instance_id = std::env::var("WAYBILL_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default();

    StandbyRouterConfig {
        enabled: standby.enabled,
        redis_url,
        lock_key: standby.lock_key.clone(),
        lock_ttl_seconds: standby.lock_ttl_seconds,
        heartbeat_interval_seconds: standby.heartbeat_interval_seconds,
        instance_id,
    }
}

/// Load notification configuration from environment variables
fn load_notification_config() -> NotificationConfig {
    let teams_enabled = std::env::var("NOTIFICATION_TEAMS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let teams_webhook_url = std::env::var("NOTIFICATION_TEAMS_WEBHOOK_URL").ok();

    let min_severity = std::env::var("NOTIFICATION_MIN_SEVERITY")
        .map(|s| match s.to_uppercase().as_str() {
            "INFO" => WarningSeverity::Info,
            "WARN" | "WARNING" => WarningSeverity::Warn,
            "ERROR" => WarningSeverity::Error,
            "CRITICAL" => WarningSeverity::Critical,
            _ => WarningSeverity::Warn,
        })
        .unwrap_or(WarningSeverity::Warn);

    let batch_interval_seconds = std::env::var("NOTIFICATION_BATCH_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300); // 5 minutes default

    NotificationConfig {
        teams_enabled,
        teams_webhook_url,
        min_severity,
        batch_interval_seconds,
    }
}

/// Build config sync configuration from the loaded app config, with the
/// resolved control-endpoint URL passed in separately (it may come from
/// `WAYBILL_CONFIG_URL` rather than the TOML file).
fn load_config_sync_config(app_config: &AppConfig, config_url: &str) -> ConfigSyncConfig {
    let sync = &app_config.router.config_sync;

    ConfigSyncConfig {
        enabled: true,
        config_url: config_url.to_string(),
        sync_interval: Duration::from_secs(sync.interval_seconds),
        max_retry_attempts: sync.max_retry_attempts,
        retry_delay: Duration::from_secs(sync.retry_delay_seconds),
        request_timeout: Duration::from_secs(sync.request_timeout_seconds),
        fail_on_initial_sync_error: sync.fail_on_initial_error,
    }
}

/// Create development configuration with LocalStack SQS queues
fn create_dev_config() -> RouterConfig {
    // LocalStack uses this URL format for SQS queues
    // Can be overridden via LOCALSTACK_SQS_HOST env var
    let sqs_host = std::env::var("LOCALSTACK_SQS_HOST")
        .unwrap_or_else(|_| "http://sqs.eu-west-1.localhost.localstack.cloud:4566".to_string());

    RouterConfig {
        processing_pools: vec![
            PoolConfig {
                code: "DEFAULT".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
                queue_capacity: None,
            },
            PoolConfig {
                code: "HIGH".to_string(),
                concurrency: 20,
                rate_limit_per_minute: None,
                queue_capacity: Some(1000),
            },
            PoolConfig {
                code: "LOW".to_string(),
                concurrency: 5,
                rate_limit_per_minute: Some(60),
                queue_capacity: Some(100),
            },
        ],
        queues: vec![
            QueueConfig {
                name: "waybill-high-priority.fifo".to_string(),
                uri: format!("{}/000000000000/waybill-high-priority.fifo", sqs_host),
                connections: 2,
                visibility_timeout: 120,
            },
            QueueConfig {
                name: "waybill-default.fifo".to_string(),
                uri: format!("{}/000000000000/waybill-default.fifo", sqs_host),
                connections: 2,
                visibility_timeout: 120,
            },
            QueueConfig {
                name: "waybill-low-priority.fifo".to_string(),
                uri: format!("{}/000000000000/waybill-low-priority.fifo", sqs_host),
                connections: 1,
                visibility_timeout: 120,
            },
        ],
    }
}

/// Build the CORS layer from configured origins. An empty list or a literal
/// `*` falls back to allowing any origin; otherwise only the listed origins
/// are permitted.
fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    let allow_origin = if cors_origins.is_empty() || cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<_> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Log startup summary
fn log_startup_summary(lifecycle: &LifecycleManager) {
    info!("=== Waybill Router Startup Summary ===");

    if lifecycle.is_leader() {
        info!("  Mode: ACTIVE (processing messages)");
    } else {
        info!("  Mode: STANDBY (waiting for leadership)");
    }

    if lifecycle.standby().is_some() {
        info!("  HA: Enabled (Active/Standby with Redis leader election)");
    } else {
        info!("  HA: Disabled (single instance mode)");
    }

    if lifecycle.config_sync().is_some() {
        info!("  Config Sync: Enabled (dynamic configuration updates)");
    } else {
        info!("  Config Sync: Disabled (static configuration)");
    }

    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// Simple SQS publisher implementation
use async_trait::async_trait;
use waybill_queue::{QueuePublisher, QueueError};
use waybill_common::Message;

struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsPublisher {
    fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueuePublisher for SqsPublisher {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn publish(&self, message: Message) -> waybill_queue::Result<String> {
        let message_id = message.id.clone();
        let body = serde_json::to_string(&message)?;

        let mut request = self.client.send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        // FIFO queues require message_group_id and message_deduplication_id
        if self.queue_url.ends_with(".fifo") {
            let group_id = message.message_group_id.clone()
                .unwrap_or_else(|| "default".to_string());
            request = request
                .message_group_id(group_id)
                .message_deduplication_id(&message_id);
        }

        request.send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(message_id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> waybill_queue::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = self.publish(message).await?;
            ids.push(id);
        }
        Ok(ids)
    }
}

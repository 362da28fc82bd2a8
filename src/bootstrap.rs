//! # Ingestion Bootstrap
//!
//! Process wiring for the ingestion service:
//!
//! 1. connect to PostgreSQL under the heavy retry policy
//! 2. initialise the schema (fatal on failure)
//! 3. warm the cache from the store (non-fatal)
//! 4. start the consumer, and the test-order producer when enabled
//! 5. wait for a shutdown signal, then stop tasks within bounded waits and
//!    close the service
//!
//! [`IngestBootstrap::start`] takes already-built components so the same
//! lifecycle runs against in-memory fakes in tests. [`IngestBootstrap::bootstrap`]
//! builds the Postgres and Kafka components from [`IngestConfig`].

use crate::cache::TtlOrderCache;
use crate::config::IngestConfig;
use crate::constants::timeouts;
use crate::error::Result;
use crate::logging::{log_broker_operation, log_error};
use crate::messaging::{
    DeadLetterPublisher, MessageBroker, MessagePublisher, OrderConsumer, OrderProducer,
};
use crate::metrics::IngestMetrics;
use crate::services::{OrderService, OrderStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Externally-built collaborators handed to [`IngestBootstrap::start`]
pub struct IngestComponents {
    pub store: Arc<dyn OrderStore>,
    pub broker: Arc<dyn MessageBroker>,
    /// Used for dead-lettering and, when enabled, test orders
    pub publisher: Arc<dyn MessagePublisher>,
}

/// Running ingestion system
pub struct IngestSystemHandle {
    service: Arc<OrderService>,
    consumer: Arc<OrderConsumer>,
    cancel: CancellationToken,
    consumer_task: Option<JoinHandle<Result<()>>>,
    producer_task: Option<JoinHandle<()>>,
    consumer_shutdown_timeout: Duration,
}

impl IngestSystemHandle {
    pub fn service(&self) -> &Arc<OrderService> {
        &self.service
    }

    pub fn consumer(&self) -> &Arc<OrderConsumer> {
        &self.consumer
    }

    /// Token shared by every background task; cancelling it begins shutdown
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolve on SIGINT, SIGTERM, or when the shared token is cancelled
    /// (for example by a consumer halting under the block policy)
    pub async fn wait_for_shutdown_signal(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => info!("🛑 Shutdown requested internally"),
            _ = shutdown_signal() => info!("🛑 Shutdown signal received"),
        }
    }

    /// Wait for a shutdown signal, then shut down
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.wait_for_shutdown_signal().await;
        self.shutdown().await
    }

    /// Cancel background tasks, wait a bounded time for each, then close the
    /// service. Returns the consumer's error if it stopped with one.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("🛑 Shutting down ingestion system");
        self.cancel.cancel();

        let mut outcome = Ok(());
        if let Some(task) = self.consumer_task.take() {
            outcome = join_bounded("consumer", task, self.consumer_shutdown_timeout)
                .await
                .unwrap_or(Ok(()));
        }

        if let Some(task) = self.producer_task.take() {
            join_bounded("producer", task, timeouts::PRODUCER_SHUTDOWN).await;
        }

        self.service.close().await;

        let stats = self.consumer.stats();
        info!(
            received = stats.received,
            processed = stats.processed,
            dead_lettered = stats.dead_lettered,
            "✅ Ingestion system stopped"
        );
        outcome
    }
}

impl std::fmt::Debug for IngestSystemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestSystemHandle")
            .field("running", &self.is_running())
            .field("consumer_state", &self.consumer.state())
            .field("producer", &self.producer_task.is_some())
            .finish_non_exhaustive()
    }
}

/// Wait up to `limit` for a task. A task still running at the deadline is
/// aborted and `None` is returned.
async fn join_bounded<T>(name: &'static str, mut task: JoinHandle<T>, limit: Duration) -> Option<T> {
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(output)) => {
            info!(task = name, "✅ Background task stopped");
            Some(output)
        }
        Ok(Err(e)) => {
            error!(task = name, error = %e, "❌ Background task panicked or was aborted");
            None
        }
        Err(_) => {
            warn!(
                task = name,
                timeout_secs = limit.as_secs(),
                "⏰ Background task did not stop in time, aborting"
            );
            task.abort();
            None
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "⚠️ Could not install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Unified bootstrap for the ingestion service
pub struct IngestBootstrap;

impl IngestBootstrap {
    /// Build Postgres and Kafka components from `config` and start the system
    #[cfg(feature = "kafka")]
    pub async fn bootstrap(config: &IngestConfig) -> Result<IngestSystemHandle> {
        use crate::database::{DatabaseConnection, PostgresOrderStore};
        use crate::messaging::{KafkaBroker, KafkaPublisher};
        use crate::resilience::RetryExecutor;

        info!("🚀 BOOTSTRAP: Starting order ingestion service");
        config.validate()?;

        let metrics = IngestMetrics::disabled();
        let cancel = CancellationToken::new();

        let connection = DatabaseConnection::connect(
            &config.postgres_dsn,
            &config.pool_settings(),
            &RetryExecutor::heavy().with_metrics(metrics.clone()),
            &cancel,
        )
        .await?;
        let store = PostgresOrderStore::new(connection.into_pool(), metrics.clone())
            .with_cancellation(&cancel);

        let brokers = config.brokers();
        let broker = KafkaBroker::new(&brokers, &config.kafka_group_id, &config.kafka_topic)?;
        let publisher = KafkaPublisher::new(&brokers)?;

        Self::start(
            config,
            IngestComponents {
                store: Arc::new(store),
                broker: Arc::new(broker),
                publisher: Arc::new(publisher),
            },
            metrics,
            cancel,
        )
        .await
    }

    /// Initialise the store, warm the cache and spawn the background tasks
    pub async fn start(
        config: &IngestConfig,
        components: IngestComponents,
        metrics: IngestMetrics,
        cancel: CancellationToken,
    ) -> Result<IngestSystemHandle> {
        let IngestComponents {
            store,
            broker,
            publisher,
        } = components;

        if let Err(e) = store.init().await {
            log_error("bootstrap", "init_store", &e.to_string(), None);
            store.close().await;
            return Err(e);
        }
        info!("✅ BOOTSTRAP: Order store initialised");

        let cache = TtlOrderCache::new(config.cache_ttl()).with_metrics(metrics.clone());
        let service = Arc::new(OrderService::new(
            store,
            Arc::new(cache),
            config.service_settings(),
        ));

        match service.warm_up_cache().await {
            Ok(size) => info!(orders = size, "✅ BOOTSTRAP: Cache warm-up complete"),
            Err(e) => warn!(error = %e, "⚠️ BOOTSTRAP: Cache warm-up failed, starting with an empty cache"),
        }

        let dead_letter =
            DeadLetterPublisher::new(publisher.clone(), broker.topic()).with_metrics(metrics.clone());
        let topic = broker.topic().to_string();
        let consumer = Arc::new(
            OrderConsumer::new(broker, service.clone())
                .with_validator(config.consumer_validator())
                .with_dead_letter(dead_letter)
                .with_failure_policy(config.processing_failure_policy)
                .with_metrics(metrics.clone()),
        );

        let consumer_task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = consumer.run(cancel.clone()).await;
                if let Err(e) = &result {
                    log_error("consumer", "run", &e.to_string(), None);
                    cancel.cancel();
                }
                result
            })
        };
        log_broker_operation(
            "subscribe",
            &topic,
            None,
            None,
            "consuming",
            Some(&format!("{:?}", config.processing_failure_policy)),
        );

        let producer_task = config.producer_enabled.then(|| {
            let producer = OrderProducer::new(publisher, topic).with_metrics(metrics);
            let interval = config.producer_interval();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer.run(interval, cancel).await })
        });

        Ok(IngestSystemHandle {
            service,
            consumer,
            cancel,
            consumer_task: Some(consumer_task),
            producer_task,
            consumer_shutdown_timeout: config.consumer_shutdown_timeout(),
        })
    }
}

//! Process-level wiring: breaker, queues and dispatcher built from config.

use std::sync::Arc;

use tracing::info;

use crate::circuit::CircuitBreaker;
use crate::config::{ConfigError, RelayConfig};
use crate::delivery::GuardedDelivery;
use crate::dispatcher::TriggerDispatcher;
use crate::jobs::PendingTriggerStore;
use crate::notify::OperatorNotifier;
use crate::queue::QueueContext;
use crate::registry::{BootstrapReport, TenantQueueRegistry};
use crate::tenants::{DirectoryError, TenantDirectory};
use crate::upstream::TriggerUpstream;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] DirectoryError),
}

/// A running relay. Clone the [`dispatcher`](Self::dispatcher) into request
/// handlers; call [`shutdown`](Self::shutdown) once on the way out.
#[derive(Debug)]
pub struct TriggerRelay {
    config: RelayConfig,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<TenantQueueRegistry>,
    dispatcher: TriggerDispatcher,
    bootstrap: BootstrapReport,
}

impl TriggerRelay {
    /// Validate config, build the shared breaker and start a retry queue for
    /// every tenant in `directory`.
    pub async fn start(
        config: RelayConfig,
        store: Arc<dyn PendingTriggerStore>,
        directory: Arc<dyn TenantDirectory>,
        upstream: Arc<dyn TriggerUpstream>,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let delivery = GuardedDelivery::new(Arc::clone(&breaker), upstream);
        let registry = Arc::new(TenantQueueRegistry::new(QueueContext {
            store,
            delivery: delivery.clone(),
            notifier: Arc::clone(&notifier),
            retry_interval: config.retry_interval,
            sweep_concurrency: config.sweep_concurrency,
        }));
        let dispatcher = TriggerDispatcher::new(delivery, Arc::clone(&registry), notifier);

        let bootstrap = registry.bootstrap(directory.as_ref()).await?;
        info!(
            tenants = bootstrap.started.len(),
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            circuit_timeout_ms = config.circuit.timeout.as_millis() as u64,
            circuit_threshold = config.circuit.threshold,
            "trigger relay started"
        );

        Ok(Self {
            config,
            breaker,
            registry,
            dispatcher,
            bootstrap,
        })
    }

    pub fn dispatcher(&self) -> &TriggerDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<TenantQueueRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn bootstrap_report(&self) -> &BootstrapReport {
        &self.bootstrap
    }

    /// Stop all tenant sweepers and wait for them to drain.
    pub async fn shutdown(self) {
        self.registry.shutdown().await;
        info!("trigger relay stopped");
    }
}

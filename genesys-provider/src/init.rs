//! Pool Initializer - one-time pre-fill of the client pool

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfiguration, ConfigurationFactory};
use crate::config::ProviderConfig;
use crate::pool::{ClientPool, METRICS_LOGGING_INTERVAL, PoolError};

/// Result of a successful initialization
#[derive(Debug)]
pub struct Provisioned {
    /// Configuration for callers that do not go through the pool
    pub default_config: ClientConfiguration,
    pub pool: ClientPool,
}

/// Number of slots authorized at the same time during pre-fill
pub fn prefill_concurrency(slots: usize) -> usize {
    slots.min((slots / 4).max(5))
}

/// Process-wide pool service, initialized at most once.
///
/// The outcome of the first initialization, success or failure, is kept;
/// later calls return it without doing any work.
#[derive(Debug, Default)]
pub struct SdkClientPool {
    state: OnceCell<Result<Arc<Provisioned>, PoolError>>,
}

impl SdkClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(
        &self,
        config: &ProviderConfig,
        version: &str,
    ) -> Result<Arc<Provisioned>, PoolError> {
        self.state
            .get_or_init(|| async {
                match ConfigurationFactory::new(config.clone(), version) {
                    Ok(factory) => provision(Arc::new(factory)).await,
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .clone()
    }

    /// Initialize from an already constructed factory.
    pub async fn init_with_factory(
        &self,
        factory: ConfigurationFactory,
    ) -> Result<Arc<Provisioned>, PoolError> {
        self.state
            .get_or_init(|| provision(Arc::new(factory)))
            .await
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state.get(), Some(Ok(_)))
    }

    pub fn get(&self) -> Result<Arc<Provisioned>, PoolError> {
        match self.state.get() {
            Some(result) => result.clone(),
            None => Err(PoolError::NotInitialized),
        }
    }

    pub fn pool(&self) -> Result<ClientPool, PoolError> {
        self.get().map(|provisioned| provisioned.pool.clone())
    }

    /// Close the pool if initialization succeeded.
    pub fn close(&self) {
        if let Some(Ok(provisioned)) = self.state.get() {
            provisioned.pool.close();
        }
    }
}

async fn provision(factory: Arc<ConfigurationFactory>) -> Result<Arc<Provisioned>, PoolError> {
    factory.config().validate()?;

    info!("Initializing default SDK client.");
    let default_config = factory.build_default().await?;

    let settings = factory.config().pool.clone();
    let pool = ClientPool::new(settings.clone());
    if settings.debug_logging {
        debug!(
            "Initialized {} SDK clients in the Pool with acquire timeout {:?} and init timeout {:?}.",
            settings.max_clients, settings.acquire_timeout, settings.init_timeout
        );
    }

    let outcome = tokio::time::timeout(settings.init_timeout, prefill(factory, &pool)).await;
    match outcome {
        Ok(Ok(())) => {
            if settings.debug_logging {
                debug!("Successfully pre-filled client pool - {}", pool.metrics());
                pool.spawn_metrics_logger(METRICS_LOGGING_INTERVAL, CancellationToken::new());
            }
            Ok(Arc::new(Provisioned {
                default_config,
                pool,
            }))
        }
        Ok(Err(e)) => {
            if settings.debug_logging {
                debug!("Error pre-filling client pool - {}", pool.metrics());
            }
            pool.close();
            Err(e)
        }
        Err(_) => {
            if settings.debug_logging {
                debug!("Timed out pre-filling client pool - {}", pool.metrics());
            }
            pool.close();
            Err(PoolError::InitTimeout(settings.init_timeout))
        }
    }
}

/// Authorize one configuration per slot. The first failure aborts the rest;
/// dropping this future (on timeout) aborts every outstanding task.
async fn prefill(factory: Arc<ConfigurationFactory>, pool: &ClientPool) -> Result<(), PoolError> {
    let slots = pool.capacity();
    if pool.settings().debug_logging {
        debug!("Prefilling SDK client pool with {} clients.", slots);
    }

    let limit = Arc::new(Semaphore::new(prefill_concurrency(slots)));
    let mut tasks = JoinSet::new();
    for _ in 0..slots {
        let factory = factory.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.map_err(|_| PoolError::Closed)?;
            factory.build().await.map_err(PoolError::from)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(config)) => {
                pool.add(config);
            }
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::client::FactoryError;
    use crate::client::tests::{FakeAuthorizer, credentials_factory, token_factory};
    use crate::config::ConfigError;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn concurrency_limit() {
        assert_eq!(prefill_concurrency(1), 1);
        assert_eq!(prefill_concurrency(3), 3);
        assert_eq!(prefill_concurrency(10), 5);
        assert_eq!(prefill_concurrency(20), 5);
        assert_eq!(prefill_concurrency(40), 10);
    }

    #[tokio::test]
    async fn fills_every_slot() {
        let service = SdkClientPool::new();
        assert!(!service.is_ready());
        assert!(matches!(service.get(), Err(PoolError::NotInitialized)));

        let provisioned = service.init_with_factory(token_factory()).await.unwrap();
        assert!(service.is_ready());
        assert_eq!(provisioned.pool.capacity(), 10);
        assert_eq!(provisioned.pool.idle(), 10);
        assert_eq!(provisioned.default_config.access_token(), "token");
    }

    #[tokio::test(start_paused = true)]
    async fn second_init_is_a_no_op() {
        let authorizer = Arc::new(FakeAuthorizer::new());
        let service = SdkClientPool::new();
        let first = service
            .init_with_factory(credentials_factory(authorizer.clone()))
            .await
            .unwrap();
        // default configuration plus ten slots
        assert_eq!(authorizer.calls.load(Ordering::SeqCst), 11);

        let again = service
            .init_with_factory(credentials_factory(authorizer.clone()))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(authorizer.calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_init_timeout_fails_with_init_timeout() {
        let authorizer = Arc::new(FakeAuthorizer {
            delay: Duration::from_millis(200),
            ..FakeAuthorizer::new()
        });
        let mut config = ProviderConfig::with_client_credentials("us-east-1", "client", "secret");
        config.pool.init_timeout = Duration::from_nanos(1);
        let factory = ConfigurationFactory::new(config, "1.0.0")
            .unwrap()
            .with_authorizer(authorizer);

        let service = SdkClientPool::new();
        let err = service.init_with_factory(factory).await.unwrap_err();
        assert!(matches!(err, PoolError::InitTimeout(_)));
        assert!(err.is_timeout());
        assert!(!service.is_ready());

        // The failure is remembered.
        assert!(matches!(service.get(), Err(PoolError::InitTimeout(_))));
        assert!(matches!(service.pool(), Err(PoolError::InitTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_failure_is_distinct_from_timeout() {
        let authorizer = Arc::new(FakeAuthorizer {
            reject: true,
            ..FakeAuthorizer::new()
        });
        let service = SdkClientPool::new();
        let err = service
            .init_with_factory(credentials_factory(authorizer))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PoolError::Authorization(FactoryError::Auth(AuthError::Rejected { .. }))
        ));
        assert!(!err.is_timeout());
        assert!(!service.is_ready());
    }

    #[tokio::test]
    async fn invalid_pool_size_is_rejected_before_authorizing() {
        let mut config = ProviderConfig::with_access_token("us-east-1", "token");
        config.pool.max_clients = 0;

        let service = SdkClientPool::new();
        let err = service.init(&config, "1.0.0").await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidConfig(ConfigError::PoolSizeOutOfRange(0))
        ));
    }

    #[tokio::test]
    async fn close_closes_initialized_pool() {
        let service = SdkClientPool::new();
        service
            .init(&ProviderConfig::with_access_token("us-east-1", "token"), "1.0.0")
            .await
            .unwrap();

        service.close();
        assert!(service.pool().unwrap().is_closed());
    }
}

//! Pooled-Execution Wrappers
//!
//! Every resource operation runs with a client checked out of the pool for
//! exactly its duration. The operation receives a copy of the provider
//! metadata carrying that client.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use genesys_core::provider::{ErrorKind, ProviderError, ProviderResult};
use genesys_platform::Platform;
use log::error;
use tokio_util::sync::CancellationToken;

use crate::client::ClientConfiguration;
use crate::pool::{ClientPool, PoolError};

/// Registry used by locally built development versions
pub const DEV_REGISTRY: &str = "genesys.com";
pub const DEV_VERSION: &str = "0.1.0";

/// Registry provider addresses resolve against.
///
/// Local builds (version `0.1.0`) use the development registry; otherwise
/// the host platform decides. With no detected platform the Terraform
/// registry is assumed.
pub fn get_registry(platform: Option<Platform>, version: &str) -> String {
    let Some(platform) = platform else {
        return Platform::Terraform.provider_registry().to_string();
    };
    if version == DEV_VERSION {
        return DEV_REGISTRY.to_string();
    }
    platform.provider_registry().to_string()
}

/// Provider-wide metadata handed to every resource operation
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    pub version: String,
    pub registry: String,
    pub platform: Platform,
    /// API domain of the configured region
    pub domain: String,
    pub max_clients: usize,
    /// The client checked out for the current operation
    pub client_config: Option<ClientConfiguration>,
}

impl ProviderMeta {
    pub fn new(version: impl Into<String>, platform: Platform, domain: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            registry: get_registry(Some(platform), &version),
            version,
            platform,
            domain: domain.into(),
            max_clients: 0,
            client_config: None,
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// The client checked out for this operation
    pub fn client(&self) -> ProviderResult<&ClientConfiguration> {
        self.client_config.as_ref().ok_or_else(|| {
            ProviderError::new("operation is not running with a pooled client")
                .with_kind(ErrorKind::Pool)
        })
    }
}

impl From<PoolError> for ProviderError {
    fn from(e: PoolError) -> Self {
        let kind = match e {
            PoolError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Pool,
        };
        ProviderError::new(e.to_string())
            .with_kind(kind)
            .with_cause(e)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Run `op` with a configuration checked out of `pool`.
///
/// A cancelled `cancel` short-circuits before anything is acquired. The
/// configuration goes back to the pool on every exit path, and errors from
/// `op` are returned unchanged. A panic in `op` is recovered and reported
/// as an error.
pub async fn with_pooled_client<T, F, Fut>(
    pool: &ClientPool,
    cancel: &CancellationToken,
    meta: &ProviderMeta,
    op: F,
) -> ProviderResult<T>
where
    F: FnOnce(ProviderMeta) -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(ProviderError::cancelled());
    }

    let client = pool
        .acquire(cancel, pool.settings().acquire_timeout)
        .await?;

    let mut scoped = meta.clone();
    scoped.client_config = Some(client.config().clone());

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::cancelled()),
        outcome = AssertUnwindSafe(op(scoped)).catch_unwind() => match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Recovered from panic in pooled operation: {}", message);
                Err(
                    ProviderError::new(format!("provider operation panicked: {}", message))
                        .with_kind(ErrorKind::Other),
                )
            }
        },
    };
    drop(client);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::token_factory;
    use crate::config::PoolSettings;
    use crate::pool::ReleaseOutcome;
    use std::time::Duration;

    async fn pool_of(size: usize, acquire_timeout: Duration) -> ClientPool {
        let factory = token_factory();
        let settings = PoolSettings {
            acquire_timeout,
            ..PoolSettings::default().with_max_clients(size)
        };
        let pool = ClientPool::new(settings);
        for _ in 0..size {
            assert_eq!(
                pool.add(factory.build().await.unwrap()),
                ReleaseOutcome::Returned
            );
        }
        pool
    }

    fn meta() -> ProviderMeta {
        ProviderMeta::new("1.40.0", Platform::OpenTofu, "mypurecloud.com").with_max_clients(2)
    }

    #[test]
    fn registry_selection() {
        assert_eq!(get_registry(None, "0.1.0"), "registry.terraform.io");
        assert_eq!(get_registry(Some(Platform::OpenTofu), "0.1.0"), "genesys.com");
        assert_eq!(
            get_registry(Some(Platform::OpenTofu), "1.40.0"),
            "registry.opentofu.org"
        );
        assert_eq!(
            get_registry(Some(Platform::Terraform), "1.40.0"),
            "registry.terraform.io"
        );
        assert_eq!(meta().registry, "registry.opentofu.org");
    }

    #[tokio::test]
    async fn operation_receives_client_and_releases_it() {
        let pool = pool_of(2, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();
        let base = meta();

        let seen = with_pooled_client(&pool, &cancel, &base, |scoped| {
            let pool = pool.clone();
            async move {
                assert_eq!(pool.metrics().active_clients, 1);
                assert_eq!(scoped.version, "1.40.0");
                Ok(scoped.client()?.base_path().to_string())
            }
        })
        .await
        .unwrap();

        assert_eq!(seen, "https://api.mypurecloud.com");
        assert!(base.client_config.is_none());
        assert_eq!(pool.metrics().active_clients, 0);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn operation_errors_pass_through_and_release() {
        let pool = pool_of(1, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();

        let err = with_pooled_client(&pool, &cancel, &meta(), |_| async {
            Err::<(), _>(ProviderError::new("409 conflict").with_kind(ErrorKind::Api))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.message, "409 conflict");
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.metrics().total_releases, 1);
    }

    #[tokio::test]
    async fn panicking_operation_becomes_an_error() {
        let pool = pool_of(1, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();

        let err = with_pooled_client(&pool, &cancel, &meta(), |scoped| async move {
            let id = scoped.client()?.id();
            if !id.is_nil() {
                panic!("lost track of client {}", id);
            }
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Other);
        assert!(err.message.contains("panicked: lost track of client"));
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.metrics().active_clients, 0);

        // the pool stays usable
        with_pooled_client(&pool, &cancel, &meta(), |_| async { Ok(()) })
            .await
            .unwrap();
    }

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn cancelled_context_never_acquires() {
        let pool = pool_of(1, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = with_pooled_client(&pool, &cancel, &meta(), |_| async { Ok(()) })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(pool.metrics().total_acquires, 0);
    }

    #[tokio::test]
    async fn acquire_timeout_reports_pool_state() {
        let pool = pool_of(1, Duration::from_millis(50)).await;
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel, Duration::from_secs(1)).await.unwrap();

        let err = with_pooled_client(&pool, &cancel, &meta(), |_| async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Pool);
        assert!(err.message.contains("Active: 1/1"));
        assert!(err.message.contains("Timeouts: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_operation_releases_client() {
        let pool = pool_of(1, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = with_pooled_client(&pool, &cancel, &meta(), |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(pool.idle(), 1);
    }
}

//! Genesys Cloud Provider
//!
//! Client runtime for the Genesys Cloud API: authorized client
//! configurations, a bounded pool of them shared by concurrently running
//! resource operations, and a REST provider built on top.
//!
//! ## Module Structure
//!
//! - `config` - Provider configuration and environment overrides
//! - `region` - Region to API domain mapping
//! - `auth` - OAuth client-credentials authorization
//! - `client` - Client configurations and the factory that builds them
//! - `debug` - SDK request/response debug records
//! - `pool` - Bounded client pool
//! - `init` - One-time pool pre-fill
//! - `pooled` - Running operations with a pooled client
//! - `provider` - GenesysProvider implementation

pub mod auth;
pub mod client;
pub mod config;
pub mod debug;
pub mod init;
pub mod pool;
pub mod pooled;
pub mod provider;
pub mod region;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, Authorizer, HttpAuthorizer};
pub use client::{ApiError, ClientConfiguration, ConfigurationFactory, FactoryError};
pub use config::{ConfigError, PoolSettings, ProviderConfig, SdkDebugFormat};
pub use init::{Provisioned, SdkClientPool};
pub use pool::{ClientPool, PoolError, PoolMetrics, PooledClient, ReleaseOutcome};
pub use pooled::{ProviderMeta, get_registry, with_pooled_client};
pub use provider::GenesysProvider;

//! Authorized client configurations and the factory that builds them

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use reqwest::{Client, Method, StatusCode, header};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use genesys_core::retry::{Attempt, Backoff, RetryError, retry_with_timeout};

use crate::auth::{AuthError, Authorizer, HttpAuthorizer};
use crate::config::{ConfigError, ProviderConfig};
use crate::debug::{self, DebugSink, ResourceContext, SdkDebugRequest, SdkDebugResponse};
use crate::region;

/// Header carrying the per-invocation transaction id
pub const CORRELATION_HEADER: &str = "TF-Correlation-Id";

/// Window during which rate-limited authorization is retried
pub const AUTH_RETRY_WINDOW: Duration = Duration::from_secs(60);

/// Retry policy for throttled and transiently failing API calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfiguration {
    pub wait_min: Duration,
    pub wait_max: Duration,
    pub retry_max: u32,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(30),
            retry_max: 20,
        }
    }
}

impl RetryConfiguration {
    /// Exponential wait before retry `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

/// `Retry-After` in seconds
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("error while creating SDK debug log {path}: {message}")]
    DebugLog { path: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    Http(String),
}

/// Failure of a single API call
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("API error {status} on {method} {path}: {message} (correlation id {correlation_id})")]
    Status {
        status: u16,
        method: String,
        path: String,
        message: String,
        correlation_id: String,
    },

    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },

    #[error("unable to decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// A 409 raised because the resource changed since it was read
    pub fn is_version_mismatch(&self) -> bool {
        match self {
            ApiError::Status {
                status, message, ..
            } => {
                *status == StatusCode::CONFLICT.as_u16()
                    && message.to_ascii_lowercase().contains("version")
            }
            _ => false,
        }
    }
}

/// Successful API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub correlation_id: String,
    path: String,
    body: Vec<u8>,
}

impl ApiResponse {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

struct Inner {
    id: Uuid,
    base_path: String,
    login_path: String,
    access_token: String,
    user_agent: String,
    retry: RetryConfiguration,
    http: Client,
    debug_sink: Option<Arc<DebugSink>>,
}

/// An authorized API client configuration.
///
/// Clones share the same underlying configuration; [`ClientConfiguration::id`]
/// identifies it.
#[derive(Clone)]
pub struct ClientConfiguration {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("id", &self.inner.id)
            .field("base_path", &self.inner.base_path)
            .field("user_agent", &self.inner.user_agent)
            .finish_non_exhaustive()
    }
}

impl ClientConfiguration {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn base_path(&self) -> &str {
        &self.inner.base_path
    }

    pub fn login_path(&self) -> &str {
        &self.inner.login_path
    }

    pub fn access_token(&self) -> &str {
        &self.inner.access_token
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    pub fn retry_configuration(&self) -> RetryConfiguration {
        self.inner.retry
    }

    /// Whether both handles refer to the same configuration
    pub fn same_as(&self, other: &ClientConfiguration) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn get(
        &self,
        path: &str,
        context: Option<&ResourceContext>,
    ) -> Result<ApiResponse, ApiError> {
        self.send(Method::GET, path, None, context).await
    }

    /// Issue an API call relative to the base path.
    ///
    /// Throttled (429) and server-side failures are retried per the retry
    /// configuration, honouring `Retry-After`. Every invocation carries a
    /// fresh correlation id and produces a request and a response debug record.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        context: Option<&ResourceContext>,
    ) -> Result<ApiResponse, ApiError> {
        let inner = &*self.inner;
        let url = format!("{}{}", inner.base_path, path);
        let payload = match body {
            Some(value) => Some(serde_json::to_vec(value).map_err(|e| ApiError::Decode {
                path: path.to_string(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let mut attempt = 0u32;
        loop {
            let transaction_id = Uuid::new_v4().to_string();
            let request_record = SdkDebugRequest::new(
                &transaction_id,
                attempt,
                method.as_str(),
                path,
                context,
                payload.as_deref(),
            );
            debug::emit(inner.debug_sink.as_deref(), &request_record);

            let mut request = inner
                .http
                .request(method.clone(), &url)
                .bearer_auth(&inner.access_token)
                .header(header::ACCEPT, "application/json")
                .header(CORRELATION_HEADER, &transaction_id);
            if let Some(payload) = &payload {
                request = request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(payload.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if attempt < inner.retry.retry_max => {
                    let wait = inner.retry.backoff(attempt);
                    warn!("{} {} failed, retrying in {:?}: {}", method, path, wait, e);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    return Err(ApiError::Transport {
                        path: path.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response.bytes().await.map_err(|e| ApiError::Transport {
                path: path.to_string(),
                message: e.to_string(),
            })?;

            let response_record = SdkDebugResponse::new(
                &request_record,
                status.as_u16(),
                retry_after.as_deref(),
                context,
                Some(bytes.as_ref()),
            );
            debug::emit(inner.debug_sink.as_deref(), &response_record);

            if should_retry(status) && attempt < inner.retry.retry_max {
                let wait = retry_after
                    .as_deref()
                    .and_then(parse_retry_after)
                    .unwrap_or_else(|| inner.retry.backoff(attempt))
                    .min(inner.retry.wait_max);
                warn!(
                    "{} {} returned {}, retrying in {:?} (correlation id {})",
                    method, path, status, wait, transaction_id
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    method: method.to_string(),
                    path: path.to_string(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                    correlation_id: transaction_id,
                });
            }

            return Ok(ApiResponse {
                status: status.as_u16(),
                correlation_id: transaction_id,
                path: path.to_string(),
                body: bytes.to_vec(),
            });
        }
    }
}

/// Builds authorized [`ClientConfiguration`]s from a [`ProviderConfig`].
///
/// All configurations built by one factory share an HTTP client and, when
/// SDK debugging is enabled, one debug log.
pub struct ConfigurationFactory {
    config: ProviderConfig,
    user_agent: String,
    base_path: String,
    login_path: String,
    http: Client,
    authorizer: Arc<dyn Authorizer>,
    debug_sink: Option<Arc<DebugSink>>,
    retry: RetryConfiguration,
    default_logged: AtomicBool,
}

impl ConfigurationFactory {
    pub fn new(config: ProviderConfig, version: &str) -> Result<Self, FactoryError> {
        let user_agent = format!("GC Terraform Provider/{}", version);

        let (base_path, login_path) = match &config.gateway {
            Some(gateway) => (gateway.url_for("api"), gateway.url_for("login")),
            None => {
                let base = region::base_path(&config.region)
                    .ok_or_else(|| ConfigError::UnknownRegion(config.region.clone()))?;
                let login = region::login_path(&config.region)
                    .ok_or_else(|| ConfigError::UnknownRegion(config.region.clone()))?;
                (base, login)
            }
        };

        let mut builder = Client::builder().user_agent(user_agent.clone());
        if let Some(proxy) = &config.proxy {
            let mut settings =
                reqwest::Proxy::all(proxy.url()).map_err(|e| FactoryError::Http(e.to_string()))?;
            if let Some(auth) = &proxy.auth {
                settings = settings.basic_auth(&auth.username, &auth.password);
            }
            builder = builder.proxy(settings);
        }
        let http = builder
            .build()
            .map_err(|e| FactoryError::Http(e.to_string()))?;

        let debug_sink = if config.sdk_debug {
            let sink = DebugSink::open(&config.sdk_debug_file_path, config.sdk_debug_format)
                .map_err(|e| FactoryError::DebugLog {
                    path: config.sdk_debug_file_path.display().to_string(),
                    message: e.to_string(),
                })?;
            Some(Arc::new(sink))
        } else {
            None
        };

        Ok(Self {
            authorizer: Arc::new(HttpAuthorizer::new(http.clone())),
            config,
            user_agent,
            base_path,
            login_path,
            http,
            debug_sink,
            retry: RetryConfiguration::default(),
            default_logged: AtomicBool::new(false),
        })
    }

    /// Replace the authorizer used for the client-credentials grant.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Retry policy given to every configuration built afterwards
    pub fn with_retry_configuration(mut self, retry: RetryConfiguration) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Build the provider-wide default configuration. Initialization is
    /// logged only for the first default build.
    pub async fn build_default(&self) -> Result<ClientConfiguration, FactoryError> {
        let is_default = !self.default_logged.swap(true, Ordering::SeqCst);
        self.build_configuration(is_default).await
    }

    /// Build a fresh, independently authorized configuration.
    pub async fn build(&self) -> Result<ClientConfiguration, FactoryError> {
        self.build_configuration(false).await
    }

    async fn build_configuration(
        &self,
        is_default: bool,
    ) -> Result<ClientConfiguration, FactoryError> {
        let access_token = match &self.config.access_token {
            Some(token) => {
                if is_default {
                    info!("Setting access token on configuration instance.");
                }
                token.clone()
            }
            None => self.authorize().await?,
        };

        if is_default {
            info!("Initialized SDK client. Debug={}", self.config.sdk_debug);
        }

        Ok(ClientConfiguration {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                base_path: self.base_path.clone(),
                login_path: self.login_path.clone(),
                access_token,
                user_agent: self.user_agent.clone(),
                retry: self.retry,
                http: self.http.clone(),
                debug_sink: self.debug_sink.clone(),
            }),
        })
    }

    /// Client-credentials grant, retrying rate-limit rejections within
    /// [`AUTH_RETRY_WINDOW`].
    async fn authorize(&self) -> Result<String, FactoryError> {
        let (Some(client_id), Some(client_secret)) = (
            self.config.oauth_client_id.as_deref(),
            self.config.oauth_client_secret.as_deref(),
        ) else {
            return Err(ConfigError::MissingCredentials.into());
        };

        let authorizer = &self.authorizer;
        let login_path = self.login_path.as_str();
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
        let result = retry_with_timeout(AUTH_RETRY_WINDOW, backoff, || async move {
            match authorizer
                .authorize_client_credentials(login_path, client_id, client_secret)
                .await
            {
                Ok(token) => Attempt::Success(token),
                Err(e) if e.is_retryable() => Attempt::retry(e),
                Err(e) => Attempt::Fail(e),
            }
        })
        .await;

        match result {
            Ok(token) => Ok(token.token),
            Err(RetryError::Failed(e)) => Err(e.into()),
            Err(RetryError::Timeout { timeout, .. }) => Err(AuthError::Timeout(timeout).into()),
            Err(RetryError::Exhausted { last_error, .. }) => Err(last_error.into()),
        }
    }
}

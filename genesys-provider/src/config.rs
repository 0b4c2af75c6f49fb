//! Provider configuration read from `GENESYSCLOUD_*` environment variables

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::region;

pub const DEFAULT_MAX_CLIENTS: usize = 10;
pub const MIN_CLIENTS: usize = 1;
pub const MAX_CLIENTS: usize = 20;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SDK_DEBUG_FILE: &str = "sdk_debug.log";

const ENV_PREFIX: &str = "GENESYSCLOUD_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration for {name}: {value:?}")]
    InvalidDuration { name: String, value: String },

    #[error("invalid number for {name}: {value:?}")]
    InvalidNumber { name: String, value: String },

    #[error("invalid boolean for {name}: {value:?}")]
    InvalidBool { name: String, value: String },

    #[error("invalid SDK debug format {0:?}, expected Text or Json")]
    InvalidDebugFormat(String),

    #[error("client pool size {0} out of range {min}..={max}", min = MIN_CLIENTS, max = MAX_CLIENTS)]
    PoolSizeOutOfRange(usize),

    #[error("unknown region {0:?}")]
    UnknownRegion(String),

    #[error("either an access token or an OAuth client id and secret must be configured")]
    MissingCredentials,
}

/// Output format of the SDK debug log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SdkDebugFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for SdkDebugFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(SdkDebugFormat::Text),
            "json" => Ok(SdkDebugFormat::Json),
            _ => Err(ConfigError::InvalidDebugFormat(s.to_string())),
        }
    }
}

/// Client pool sizing and timeouts
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_clients: usize,
    /// How long an operation may wait for a free client
    pub acquire_timeout: Duration,
    /// Upper bound on pre-filling the whole pool
    pub init_timeout: Duration,
    pub debug_logging: bool,
    /// Utilization at which acquires log a near-capacity warning
    pub near_capacity_ratio: f64,
    /// Utilization at which acquires log a critical warning
    pub critical_capacity_ratio: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            debug_logging: false,
            near_capacity_ratio: 0.5,
            critical_capacity_ratio: 0.75,
        }
    }
}

impl PoolSettings {
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: Option<u16>,
    pub protocol: String,
    pub auth: Option<BasicAuth>,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.protocol, self.host, port),
            None => format!("{}://{}", self.protocol, self.host),
        }
    }
}

/// API gateway that fronts every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub host: String,
    pub port: Option<u16>,
    pub protocol: String,
    /// `(name, value)` path parameters substituted into gateway routes
    pub path_params: Vec<(String, String)>,
    pub auth: Option<BasicAuth>,
}

impl GatewaySettings {
    pub fn base_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.protocol, self.host, port),
            None => format!("{}://{}", self.protocol, self.host),
        }
    }

    /// Gateway URL for a service (`api` or `login`), with the matching
    /// path parameter appended when one is configured
    pub fn url_for(&self, service: &str) -> String {
        let mut url = self.base_url();
        for (_, value) in self.path_params.iter().filter(|(name, _)| name == service) {
            url.push('/');
            url.push_str(value.trim_matches('/'));
        }
        url
    }
}

/// Everything needed to build authorized client configurations
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub access_token: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub region: String,
    pub sdk_debug: bool,
    pub sdk_debug_format: SdkDebugFormat,
    pub sdk_debug_file_path: PathBuf,
    pub pool: PoolSettings,
    pub proxy: Option<ProxySettings>,
    pub gateway: Option<GatewaySettings>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ProviderConfig")
            .field("access_token", &redact(&self.access_token))
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_client_secret", &redact(&self.oauth_client_secret))
            .field("region", &self.region)
            .field("sdk_debug", &self.sdk_debug)
            .field("sdk_debug_format", &self.sdk_debug_format)
            .field("sdk_debug_file_path", &self.sdk_debug_file_path)
            .field("pool", &self.pool)
            .field("proxy", &self.proxy)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl ProviderConfig {
    /// Configuration authorized with a pre-issued access token
    pub fn with_access_token(region: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            region: region.into(),
            sdk_debug_file_path: PathBuf::from(DEFAULT_SDK_DEBUG_FILE),
            ..Default::default()
        }
    }

    /// Configuration authorized through the client-credentials grant
    pub fn with_client_credentials(
        region: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            oauth_client_id: Some(client_id.into()),
            oauth_client_secret: Some(client_secret.into()),
            region: region.into(),
            sdk_debug_file_path: PathBuf::from(DEFAULT_SDK_DEBUG_FILE),
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Names passed to `lookup`
    /// carry the `GENESYSCLOUD_` prefix; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let mut pool = PoolSettings {
            debug_logging: vars.flag("SDK_CLIENT_POOL_DEBUG")?,
            ..Default::default()
        };
        if let Some(size) = vars.number::<usize>("TOKEN_POOL_SIZE")? {
            pool.max_clients = size;
        }
        if let Some(timeout) = vars.duration("TOKEN_ACQUIRE_TIMEOUT")? {
            pool.acquire_timeout = timeout;
        }
        if let Some(timeout) = vars.duration("TOKEN_INIT_TIMEOUT")? {
            pool.init_timeout = timeout;
        }

        let proxy = match vars.get("PROXY_HOST") {
            Some(host) => Some(ProxySettings {
                host,
                port: vars.number("PROXY_PORT")?,
                protocol: vars.get("PROXY_PROTOCOL").unwrap_or_else(|| "http".to_string()),
                auth: vars.basic_auth("PROXY_AUTH"),
            }),
            None => None,
        };

        let gateway = match vars.get("GATEWAY_HOST") {
            Some(host) => {
                let path_params = match (
                    vars.get("GATEWAY_PATH_PARAMS_NAME"),
                    vars.get("GATEWAY_PATH_PARAMS_VALUE"),
                ) {
                    (Some(name), Some(value)) => vec![(name, value)],
                    _ => Vec::new(),
                };
                Some(GatewaySettings {
                    host,
                    port: vars.number("GATEWAY_PORT")?,
                    protocol: vars
                        .get("GATEWAY_PROTOCOL")
                        .unwrap_or_else(|| "https".to_string()),
                    path_params,
                    auth: vars.basic_auth("GATEWAY_AUTH"),
                })
            }
            None => None,
        };

        Ok(Self {
            access_token: vars.get("ACCESS_TOKEN"),
            oauth_client_id: vars.get("OAUTHCLIENT_ID"),
            oauth_client_secret: vars.get("OAUTHCLIENT_SECRET"),
            region: vars
                .get("REGION")
                .unwrap_or_else(|| region::DEFAULT_REGION.to_string()),
            sdk_debug: vars.flag("SDK_DEBUG")?,
            sdk_debug_format: match vars.get("SDK_DEBUG_FORMAT") {
                Some(format) => format.parse()?,
                None => SdkDebugFormat::Text,
            },
            sdk_debug_file_path: vars
                .get("SDK_DEBUG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SDK_DEBUG_FILE)),
            pool,
            proxy,
            gateway,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CLIENTS..=MAX_CLIENTS).contains(&self.pool.max_clients) {
            return Err(ConfigError::PoolSizeOutOfRange(self.pool.max_clients));
        }
        if region::domain(&self.region).is_none() {
            return Err(ConfigError::UnknownRegion(self.region.clone()));
        }
        let has_client_credentials =
            self.oauth_client_id.is_some() && self.oauth_client_secret.is_some();
        if self.access_token.is_none() && !has_client_credentials {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn name(key: &str) -> String {
        format!("{}{}", ENV_PREFIX, key)
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&Self::name(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(false),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidBool {
                    name: Self::name(key),
                    value,
                }),
            },
        }
    }

    fn number<N: std::str::FromStr>(&self, key: &str) -> Result<Option<N>, ConfigError> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidNumber {
                    name: Self::name(key),
                    value,
                })
            })
            .transpose()
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.get(key)
            .map(|value| {
                parse_duration(&value).ok_or_else(|| ConfigError::InvalidDuration {
                    name: Self::name(key),
                    value,
                })
            })
            .transpose()
    }

    fn basic_auth(&self, prefix: &str) -> Option<BasicAuth> {
        let username = self.get(&format!("{}_USERNAME", prefix))?;
        let password = self.get(&format!("{}_PASSWORD", prefix)).unwrap_or_default();
        Some(BasicAuth { username, password })
    }
}

/// Parse a duration written as a sequence of `<number><unit>` pairs,
/// e.g. `300ms`, `1m30s`, `1.5h`. Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`.
/// A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_end..];
        nanos += value * scale;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

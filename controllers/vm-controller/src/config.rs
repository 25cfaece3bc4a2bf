//! Controller configuration
//!
//! Read once from the environment at startup and shared as `Arc<Config>`.
//! Nothing re-reads the environment after that.

use crate::error::ControllerError;
use jsonwebtoken::Algorithm;
use kubevirt_client::{ClusterSettings, ManifestOptions, RetryConfig, WatchSettings};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BRIDGE_CAPACITY: usize = 64;
const DEFAULT_STORAGE_CLASS: &str = "standard";
const DEFAULT_TOKEN_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_WATCH_BACKOFF_MIN_SECONDS: u64 = 1;
const DEFAULT_WATCH_BACKOFF_MAX_SECONDS: u64 = 60;
const DEFAULT_CLUSTER_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_RECONCILE_ATTEMPTS: u32 = 5;

/// Immutable configuration snapshot
#[derive(Clone)]
pub struct Config {
    pub api_url: String,
    pub cluster_token: String,
    pub insecure_tls: bool,
    /// Namespace used when a request does not name one
    pub namespace: String,
    /// Namespaces to watch; always contains `namespace`
    pub watch_namespaces: Vec<String>,
    pub bridge: String,
    /// Uplink enslaved to the bridge at startup
    pub interface: String,
    pub bridge_capacity: usize,
    pub default_node: Option<String>,
    pub storage_class: String,
    pub secret_key: String,
    pub algorithm: Algorithm,
    pub access_token_expire: Duration,
    pub token_cache_ttl: Duration,
    pub watch_backoff_min: Duration,
    pub watch_backoff_max: Duration,
    pub cluster_retry_attempts: u32,
    pub max_reconcile_attempts: u32,
    pub templates_path: Option<PathBuf>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("cluster_token", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .field("namespace", &self.namespace)
            .field("watch_namespaces", &self.watch_namespaces)
            .field("bridge", &self.bridge)
            .field("interface", &self.interface)
            .field("bridge_capacity", &self.bridge_capacity)
            .field("default_node", &self.default_node)
            .field("storage_class", &self.storage_class)
            .field("secret_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_token_expire", &self.access_token_expire)
            .field("token_cache_ttl", &self.token_cache_ttl)
            .field("watch_backoff_min", &self.watch_backoff_min)
            .field("watch_backoff_max", &self.watch_backoff_max)
            .field("cluster_retry_attempts", &self.cluster_retry_attempts)
            .field("max_reconcile_attempts", &self.max_reconcile_attempts)
            .field("templates_path", &self.templates_path)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let namespace = vars.required("NAMESPACE")?;
        let mut watch_namespaces: Vec<String> = vars
            .optional("WATCH_NAMESPACES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !watch_namespaces.contains(&namespace) {
            watch_namespaces.insert(0, namespace.clone());
        }

        let watch_backoff_min = Duration::from_secs(
            vars.parsed("WATCH_BACKOFF_MIN_SECONDS", DEFAULT_WATCH_BACKOFF_MIN_SECONDS)?,
        );
        let watch_backoff_max = Duration::from_secs(
            vars.parsed("WATCH_BACKOFF_MAX_SECONDS", DEFAULT_WATCH_BACKOFF_MAX_SECONDS)?,
        );
        if watch_backoff_min.is_zero() || watch_backoff_max < watch_backoff_min {
            return Err(ControllerError::InvalidConfig(
                "WATCH_BACKOFF_MIN_SECONDS must be at least 1 and not exceed WATCH_BACKOFF_MAX_SECONDS"
                    .to_string(),
            ));
        }

        let expire_minutes: u64 = vars
            .required("ACCESS_TOKEN_EXPIRE_MINUTES")?
            .parse()
            .map_err(|_| invalid("ACCESS_TOKEN_EXPIRE_MINUTES", "expected a number of minutes"))?;
        if expire_minutes == 0 {
            return Err(invalid("ACCESS_TOKEN_EXPIRE_MINUTES", "must be at least 1"));
        }
        let access_token_expire = expire_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| invalid("ACCESS_TOKEN_EXPIRE_MINUTES", "is too large"))?;

        let bridge_capacity = vars.parsed("BRIDGE_CAPACITY", DEFAULT_BRIDGE_CAPACITY)?;
        if bridge_capacity == 0 {
            return Err(invalid("BRIDGE_CAPACITY", "must be at least 1"));
        }
        let cluster_retry_attempts = vars.parsed("CLUSTER_RETRY_ATTEMPTS", DEFAULT_CLUSTER_RETRY_ATTEMPTS)?;
        if cluster_retry_attempts == 0 {
            return Err(invalid("CLUSTER_RETRY_ATTEMPTS", "must be at least 1"));
        }

        Ok(Self {
            api_url: vars.required("KUBERNETES_API_URL")?,
            cluster_token: vars.required("KUBERNETES_TOKEN")?,
            insecure_tls: vars.parsed("KUBERNETES_INSECURE_TLS", false)?,
            namespace,
            watch_namespaces,
            bridge: vars.required("BRIDGE")?,
            interface: vars.required("INTERFACE")?,
            bridge_capacity,
            default_node: vars.optional("DEFAULT_NODE"),
            storage_class: vars
                .optional("STORAGE_CLASS")
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            secret_key: vars.required("SECRET_KEY")?,
            algorithm: parse_algorithm(&vars.required("ALGORITHM")?)?,
            access_token_expire,
            token_cache_ttl: Duration::from_secs(
                vars.parsed("TOKEN_CACHE_TTL_SECONDS", DEFAULT_TOKEN_CACHE_TTL_SECONDS)?,
            ),
            watch_backoff_min,
            watch_backoff_max,
            cluster_retry_attempts,
            max_reconcile_attempts: vars.parsed("MAX_RECONCILE_ATTEMPTS", DEFAULT_MAX_RECONCILE_ATTEMPTS)?,
            templates_path: vars.optional("TEMPLATES_PATH").map(PathBuf::from),
        })
    }

    /// Settings for the KubeVirt client
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            api_url: self.api_url.clone(),
            token: self.cluster_token.clone(),
            insecure_tls: self.insecure_tls,
            default_namespace: self.namespace.clone(),
            manifest: ManifestOptions {
                bridge: self.bridge.clone(),
                storage_class: self.storage_class.clone(),
                node: self.default_node.clone(),
            },
            retry: RetryConfig::with_max_attempts(self.cluster_retry_attempts),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            backoff_min: self.watch_backoff_min,
            backoff_max: self.watch_backoff_max,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ControllerError> {
        self.optional(key).ok_or_else(|| {
            ControllerError::InvalidConfig(format!("{key} environment variable is required"))
        })
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ControllerError> {
        match self.optional(key) {
            Some(value) => value
                .parse()
                .map_err(|_| invalid(key, &format!("cannot parse '{value}'"))),
            None => Ok(default),
        }
    }
}

fn invalid(key: &str, reason: &str) -> ControllerError {
    ControllerError::InvalidConfig(format!("{key}: {reason}"))
}

fn parse_algorithm(value: &str) -> Result<Algorithm, ControllerError> {
    match value.to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(invalid(
            "ALGORITHM",
            &format!("unsupported algorithm '{other}', expected HS256, HS384 or HS512"),
        )),
    }
}

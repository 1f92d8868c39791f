use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{
    collections::BTreeMap,
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration, read from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Maximum number of in-flight requests per pooled service client.
    #[serde(default = "default_pipelining_depth")]
    pub pipelining_depth: usize,
    #[serde(default = "default_plan_cache_size")]
    pub plan_cache_size: usize,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub delegation: DelegationPolicy,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Reject operations that carry no bearer token.
    #[serde(default)]
    pub require_token: bool,
}

/// Deadlines applied to delegated calls. Both are unset by default, in which
/// case a hung backend blocks only the operation waiting on it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelegationPolicy {
    /// Upper bound for a single delegated round-trip.
    pub timeout_ms: Option<u64>,
    /// Deadline set when an operation enters the gateway and inherited by
    /// every delegation it causes.
    pub request_timeout_ms: Option<u64>,
}

impl DelegationPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_introspection_attempts")]
    pub introspection_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        StartupConfig {
            introspection_attempts: default_introspection_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl StartupConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One entry of the `services` map; the map key is the service name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceEntry {
    pub href: Option<String>,
    pub port: Option<u16>,
    /// Partial subschema configuration, deep-merged over the defaults.
    pub config: Option<Value>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000))
}

fn default_pipelining_depth() -> usize {
    10
}

fn default_plan_cache_size() -> usize {
    256
}

fn default_introspection_attempts() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: default_listen(),
            pipelining_depth: default_pipelining_depth(),
            plan_cache_size: default_plan_cache_size(),
            auth: AuthConfig::default(),
            delegation: DelegationPolicy::default(),
            startup: StartupConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(contents)
            .map_err(|e| GatewayError::Configuration(format!("failed to parse config: {}", e)))?;

        if config.services.is_empty() {
            return Err(GatewayError::Configuration(
                "no services declared".to_string(),
            ));
        }
        if config.pipelining_depth == 0 {
            return Err(GatewayError::Configuration(
                "pipelining_depth must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn add_service(&mut self, name: impl Into<String>, entry: ServiceEntry) {
        self.services.insert(name.into(), entry);
    }

    /// Service descriptors in name order.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|(name, entry)| ServiceDescriptor {
                name: name.clone(),
                href: entry.href.clone(),
                port: entry.port,
                config: entry.config.clone(),
            })
            .collect()
    }
}

/// Where a backend lives and how its subschema should behave.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub href: Option<String>,
    pub port: Option<u16>,
    pub config: Option<Value>,
}

impl ServiceDescriptor {
    pub fn with_port(name: impl Into<String>, port: u16) -> Self {
        ServiceDescriptor {
            name: name.into(),
            href: None,
            port: Some(port),
            config: None,
        }
    }

    pub fn with_href(name: impl Into<String>, href: impl Into<String>) -> Self {
        ServiceDescriptor {
            name: name.into(),
            href: Some(href.into()),
            port: None,
            config: None,
        }
    }

    /// An explicit `href` wins; otherwise the service is expected on the
    /// loopback interface at `port`.
    pub fn base_url(&self) -> Result<Url> {
        let raw = match (&self.href, self.port) {
            (Some(href), _) => href.clone(),
            (None, Some(port)) => format!("http://127.0.0.1:{}", port),
            (None, None) => {
                return Err(GatewayError::Configuration(format!(
                    "service `{}` declares neither `href` nor `port`",
                    self.name
                )));
            }
        };

        Url::parse(&raw).map_err(|e| {
            GatewayError::Configuration(format!(
                "service `{}` has an invalid url `{}`: {}",
                self.name, raw, e
            ))
        })
    }

    pub fn subschema_config(&self) -> Result<SubschemaConfig> {
        SubschemaConfig::resolve(&self.name, self.config.as_ref())
    }
}

/// Subschema behavior after merging the per-service override over the
/// defaults. Keys the gateway does not interpret are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubschemaConfig {
    pub batch: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubschemaConfig {
    pub fn resolve(service: &str, overrides: Option<&Value>) -> Result<Self> {
        let mut merged = json!({ "batch": true });

        if let Some(overrides) = overrides {
            if !overrides.is_object() {
                return Err(GatewayError::Configuration(format!(
                    "config override for service `{}` must be a mapping",
                    service
                )));
            }
            deep_merge(&mut merged, overrides);
        }

        serde_json::from_value(merged).map_err(|e| {
            GatewayError::Configuration(format!(
                "invalid subschema config for service `{}`: {}",
                service, e
            ))
        })
    }
}

/// Merges `overlay` into `target`. Objects merge key by key, recursively;
/// anything else in `overlay` replaces what `target` had.
pub fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

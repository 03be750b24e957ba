//! Declarative admission policies.
//!
//! Policies are loaded from configuration and turned into
//! [`AdmissionController`]s that share a single counter store. Each policy's
//! keys are namespaced by its name so that the same client is accounted
//! separately per policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::controller::{AdmissionConfig, AdmissionController, SkipPredicate, DEFAULT_MESSAGE};
use super::key::{ClientAddressKey, NamespacedKey, PathParamKey, RequestAttributes};
use super::store::WindowedCounterStore;
use crate::error::{Result, TurnstileError};

/// Name of the preset guarding public resource access.
pub const PUBLIC_ACCESS: &str = "public_access";
/// Name of the preset guarding public downloads.
pub const PUBLIC_DOWNLOAD: &str = "public_download";

const FIFTEEN_MINUTES_MS: u64 = 15 * 60 * 1000;

/// How a policy derives its accounting key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client address with proxy-header precedence
    #[default]
    ClientAddress,
    /// Client address combined with a path parameter
    PathParam { param: String },
}

/// Configuration for a single policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Message returned to rejected clients
    #[serde(default = "default_message")]
    pub message: String,
    /// Key derivation strategy
    #[serde(default)]
    pub key: KeyStrategy,
    /// Socket peer addresses that bypass accounting
    #[serde(default)]
    pub skip_addresses: Vec<String>,
    /// Whether to emit rate limit headers
    #[serde(default = "default_headers")]
    pub headers: bool,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_headers() -> bool {
    true
}

impl PolicyConfig {
    /// 100 requests per 15 minutes per client address.
    pub fn public_access() -> Self {
        Self {
            max_requests: 100,
            window_ms: FIFTEEN_MINUTES_MS,
            message: "Too many requests from this IP, please try again later.".to_string(),
            key: KeyStrategy::ClientAddress,
            skip_addresses: Vec::new(),
            headers: true,
        }
    }

    /// 50 downloads per 15 minutes per client address and share token.
    pub fn public_download() -> Self {
        Self {
            max_requests: 50,
            window_ms: FIFTEEN_MINUTES_MS,
            message: "Too many download requests, please try again later.".to_string(),
            key: KeyStrategy::PathParam {
                param: "token".to_string(),
            },
            skip_addresses: Vec::new(),
            headers: true,
        }
    }

    /// The built-in policies, keyed by name.
    pub fn presets() -> BTreeMap<String, PolicyConfig> {
        BTreeMap::from([
            (PUBLIC_ACCESS.to_string(), Self::public_access()),
            (PUBLIC_DOWNLOAD.to_string(), Self::public_download()),
        ])
    }

    /// Check that the policy is usable.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}': max_requests must be greater than zero",
                name
            )));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}': window_ms must be greater than zero",
                name
            )));
        }
        if let KeyStrategy::PathParam { param } = &self.key {
            if param.trim().is_empty() {
                return Err(TurnstileError::Config(format!(
                    "policy '{}': path_param key needs a parameter name",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Build the runtime configuration, namespacing keys with `name`.
    pub fn to_admission_config(&self, name: &str) -> Result<AdmissionConfig> {
        self.validate(name)?;

        let mut config = AdmissionConfig::new(self.max_requests, self.window_ms)
            .with_message(self.message.clone())
            .with_headers(self.headers);

        config = match &self.key {
            KeyStrategy::ClientAddress => {
                config.with_key_deriver(NamespacedKey::new(name, ClientAddressKey))
            }
            KeyStrategy::PathParam { param } => {
                config.with_key_deriver(NamespacedKey::new(name, PathParamKey::new(param.clone())))
            }
        };

        if !self.skip_addresses.is_empty() {
            config = config.with_skip(TrustedAddresses::new(self.skip_addresses.iter().cloned()));
        }

        Ok(config)
    }

    /// Build a controller for this policy on the shared store.
    pub fn build(&self, name: &str, store: Arc<WindowedCounterStore>) -> Result<AdmissionController> {
        let config = self.to_admission_config(name)?;
        Ok(AdmissionController::new(name, config, store))
    }
}

/// Skips requests whose socket peer is in a fixed set of addresses.
///
/// Only the peer reported by the transport is trusted. Forwarding headers
/// are set by the client and never grant a bypass.
#[derive(Debug, Clone, Default)]
pub struct TrustedAddresses {
    addresses: HashSet<IpAddr>,
}

impl TrustedAddresses {
    /// Build the set, ignoring entries that are not IP addresses.
    pub fn new(addresses: impl IntoIterator<Item = String>) -> Self {
        Self {
            addresses: addresses
                .into_iter()
                .filter_map(|addr| match addr.trim().parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(address = %addr, "Ignoring invalid trusted address");
                        None
                    }
                })
                .collect(),
        }
    }

    /// Whether `ip` is trusted.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(ip)
    }
}

impl SkipPredicate for TrustedAddresses {
    fn should_skip(&self, request: &RequestAttributes) -> bool {
        request
            .peer_addr
            .is_some_and(|peer| self.contains(&peer.ip()))
    }
}

/// The controllers for every configured policy, sharing one store.
#[derive(Debug, Default, Clone)]
pub struct PolicySet {
    controllers: HashMap<String, Arc<AdmissionController>>,
}

impl PolicySet {
    /// Build every policy against `store`.
    pub fn build(
        policies: &BTreeMap<String, PolicyConfig>,
        store: Arc<WindowedCounterStore>,
    ) -> Result<Self> {
        let mut controllers = HashMap::with_capacity(policies.len());

        for (name, policy) in policies {
            let controller = policy.build(name, store.clone())?;
            info!(
                policy = %name,
                max_requests = policy.max_requests,
                window_ms = policy.window_ms,
                key = ?policy.key,
                "Loaded admission policy"
            );
            controllers.insert(name.clone(), Arc::new(controller));
        }

        Ok(Self { controllers })
    }

    /// Controller for the named policy.
    pub fn get(&self, name: &str) -> Option<Arc<AdmissionController>> {
        self.controllers.get(name).cloned()
    }

    /// Number of configured policies.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether no policies are configured.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

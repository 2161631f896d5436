//! Namespaces, the configuration artifact's wire shape, and the validated,
//! immutable [`ConfigSnapshot`] derived from it.

pub mod source;
pub mod subscriber;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// One tenant, as it appears inside a published [`ConfigSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub description: String,
    pub max_memory_mb: Option<u64>,
    pub max_keys: Option<u64>,
    pub default_ttl: Option<u64>,
    pub rate_limit_qps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub password: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

fn default_refresh_interval() -> u64 {
    5
}

/// Raw deserialization target for the externally-managed JSON document
/// described in the configuration artifact contract. Never exposed past
/// validation — [`ConfigSnapshot`] is what the rest of the system sees.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    pub namespaces: Vec<NamespaceDoc>,
    #[serde(default)]
    pub workers: Vec<String>,
    pub dashboard: Option<DashboardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceDoc {
    pub name: String,
    pub apikey: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: Option<u64>,
    #[serde(rename = "maxKeys")]
    pub max_keys: Option<u64>,
    #[serde(rename = "defaultTTL")]
    pub default_ttl: Option<u64>,
    #[serde(rename = "rateLimitQPS")]
    pub rate_limit_qps: Option<u32>,
}

/// Immutable, versioned, atomically publishable configuration. Once
/// published it is never mutated — readers hold an `Arc` clone and the old
/// snapshot is reclaimed when its last reader drops it.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub namespaces: Vec<Namespace>,
    pub dashboard: DashboardConfig,
    pub workers: Vec<String>,
    /// Derived lookup table; never mutated once built.
    key_to_namespace: HashMap<String, usize>,
}

impl ConfigSnapshot {
    /// Parses and structurally validates a configuration document,
    /// producing a fully-valid snapshot or rejecting it wholesale.
    pub fn from_document(doc: ConfigDocument, version: u64) -> Result<Self, CacheError> {
        let mut seen_names = HashSet::new();
        let mut seen_keys = HashSet::new();
        let mut namespaces = Vec::with_capacity(doc.namespaces.len());

        for ns in doc.namespaces {
            if ns.name.is_empty() {
                return Err(CacheError::Config("namespace name must not be empty".into()));
            }
            if !seen_names.insert(ns.name.clone()) {
                return Err(CacheError::Config(format!("duplicate namespace name: {}", ns.name)));
            }
            if ns.apikey.is_empty() {
                return Err(CacheError::Config(format!("namespace {} is missing an api key", ns.name)));
            }
            if !seen_keys.insert(ns.apikey.clone()) {
                return Err(CacheError::Config(format!("duplicate api key for namespace {}", ns.name)));
            }
            namespaces.push(Namespace {
                name: ns.name,
                api_key: ns.apikey,
                description: ns.description,
                max_memory_mb: ns.max_memory_mb,
                max_keys: ns.max_keys,
                default_ttl: ns.default_ttl,
                rate_limit_qps: ns.rate_limit_qps,
            });
        }

        let dashboard = match doc.dashboard {
            Some(d) if !d.password.is_empty() => d,
            _ => return Err(CacheError::Config("dashboard password is required".into())),
        };

        for endpoint in &doc.workers {
            if endpoint.is_empty() || !endpoint.contains(':') {
                return Err(CacheError::Config(format!("malformed worker endpoint: {endpoint:?}")));
            }
        }

        let key_to_namespace: HashMap<String, usize> = namespaces
            .iter()
            .enumerate()
            .map(|(idx, ns)| (ns.api_key.clone(), idx))
            .collect();

        Ok(Self {
            version,
            namespaces,
            dashboard,
            workers: doc.workers,
            key_to_namespace,
        })
    }

    /// Authenticates an API key, returning the owning namespace's name.
    pub fn authenticate(&self, api_key: &str) -> Option<&Namespace> {
        self.key_to_namespace.get(api_key).map(|&idx| &self.namespaces[idx])
    }

    pub fn namespace_by_name(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}
